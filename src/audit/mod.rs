//! Audit pipeline (C9): every decision is offered to a bounded channel by a
//! non-blocking producer. A single consumer task drains it, applies a
//! per-limiter sampling rule so a noisy limiter can't flood the log, and
//! periodically emits an aggregated summary. Overflow drops the event
//! rather than blocking the caller — an audit backlog must never become a
//! rate-limiting outage.

mod event;

pub use event::{AuditEvent, AuditEventKind, AuditSummary};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where accepted audit events ultimately go. Kept as a trait (rather than
/// a hard-coded `tracing` call) so a deployment can swap in a file, a
/// message queue, or nothing at all without touching the pipeline.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, event: &AuditEvent);
    async fn write_summary(&self, limiter: &str, summary: AuditSummary);
}

/// Structured-logging sink, the default: every admitted event becomes a
/// `tracing` event at `debug` (denials at `info`, since they're rarer and
/// more often what an operator is looking for).
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn write(&self, event: &AuditEvent) {
        if event.allowed {
            tracing::debug!(
                limiter = %event.limiter,
                key = %event.masked_key,
                remaining = event.remaining,
                delay_ms = event.delay_ms,
                "rate limit decision: allowed"
            );
        } else {
            tracing::info!(
                limiter = %event.limiter,
                key = %event.masked_key,
                reset_time_ms = event.reset_time_ms,
                "rate limit decision: denied"
            );
        }
    }

    async fn write_summary(&self, limiter: &str, summary: AuditSummary) {
        tracing::info!(
            limiter,
            allowed = summary.allowed,
            denied = summary.denied,
            dropped = summary.dropped,
            "rate limit summary"
        );
    }
}

/// No-op sink for deployments that want the pipeline's backpressure
/// behavior (bounded queue, never blocks the decision path) without
/// actually recording anything.
pub struct NoopSink;

#[async_trait]
impl AuditSink for NoopSink {
    async fn write(&self, _event: &AuditEvent) {}
    async fn write_summary(&self, _limiter: &str, _summary: AuditSummary) {}
}

struct SampleState {
    minute: u64,
    count_this_minute: u32,
}

pub struct AuditPipeline {
    tx: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    queue_capacity: usize,
    dropped: Arc<AtomicU64>,
    last_drop_warning_ms: Arc<AtomicU64>,
}

impl AuditPipeline {
    /// Spawns the consumer task and returns a handle producers can share
    /// cheaply (it's just a channel sender plus a couple of atomics).
    pub fn spawn(
        sink: Arc<dyn AuditSink>,
        queue_capacity: usize,
        full_log_per_minute: u32,
        sample_rate: u32,
        summary_interval_secs: u64,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let consumer = tokio::spawn(run_consumer(
            rx,
            sink,
            full_log_per_minute,
            sample_rate.max(1),
            summary_interval_secs,
        ));
        AuditPipeline {
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            queue_capacity,
            dropped: Arc::new(AtomicU64::new(0)),
            last_drop_warning_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Offer an event. Never blocks: on a full queue, or once the pipeline
    /// has been shut down, the event is dropped and counted, with a warning
    /// emitted at most once per second so a sustained overflow doesn't
    /// itself become a logging flood.
    pub fn offer(&self, event: AuditEvent) {
        let sent = {
            let guard = self.tx.lock().unwrap();
            match guard.as_ref() {
                Some(tx) => {
                    metrics::gauge!("ratekeeper_audit_queue_depth")
                        .set((self.queue_capacity - tx.capacity()) as f64);
                    tx.try_send(event).is_ok()
                }
                None => false,
            }
        };
        if !sent {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("ratekeeper_audit_dropped_total").increment(1);
            let now = event_now_ms();
            let last = self.last_drop_warning_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) >= 1000
                && self
                    .last_drop_warning_ms
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                tracing::warn!(dropped, "audit queue full, dropping events");
            }
        }
    }

    /// Drains the queue and stops the consumer task. Closes the sender side
    /// first so the consumer's receive loop sees the channel end once
    /// everything already queued has been processed; if that doesn't happen
    /// within `timeout`, the consumer is aborted outright rather than left
    /// to drain indefinitely.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.tx.lock().unwrap().take();
        let handle = self.consumer.lock().unwrap().take();
        let Some(handle) = handle else {
            return;
        };
        let abort_handle = handle.abort_handle();
        if tokio::time::timeout(timeout, handle).await.is_err() {
            tracing::warn!("audit consumer did not drain within timeout, forcing stop");
            abort_handle.abort();
        }
    }
}

fn event_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn run_consumer(
    mut rx: mpsc::Receiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
    full_log_per_minute: u32,
    sample_rate: u32,
    summary_interval_secs: u64,
) {
    let mut sample_state: HashMap<String, SampleState> = HashMap::new();
    let mut summaries: HashMap<String, AuditSummary> = HashMap::new();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(summary_interval_secs.max(1)));

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let summary = summaries.entry(event.limiter.clone()).or_default();
                        if event.allowed {
                            summary.allowed += 1;
                        } else {
                            summary.denied += 1;
                        }

                        let log_it = event.kind.always_logged()
                            || should_log(&mut sample_state, &event, full_log_per_minute, sample_rate);
                        if log_it {
                            sink.write(&event).await;
                        }
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                for (limiter, summary) in summaries.drain() {
                    sink.write_summary(&limiter, summary).await;
                }
            }
        }
    }
}

/// First `full_log_per_minute` events per limiter per minute are logged in
/// full; after that, 1 in every `sample_rate`.
fn should_log(
    state: &mut HashMap<String, SampleState>,
    event: &AuditEvent,
    full_log_per_minute: u32,
    sample_rate: u32,
) -> bool {
    let minute = event.timestamp_ms / 60_000;
    let entry = state.entry(event.limiter.clone()).or_insert(SampleState {
        minute,
        count_this_minute: 0,
    });
    if entry.minute != minute {
        entry.minute = minute;
        entry.count_this_minute = 0;
    }
    entry.count_this_minute += 1;

    if entry.count_this_minute <= full_log_per_minute {
        return true;
    }
    (entry.count_this_minute - full_log_per_minute) % sample_rate == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for CollectingSink {
        async fn write(&self, event: &AuditEvent) {
            self.events.lock().await.push(event.clone());
        }
        async fn write_summary(&self, _limiter: &str, _summary: AuditSummary) {}
    }

    fn event(limiter: &str, ts: u64) -> AuditEvent {
        AuditEvent {
            kind: AuditEventKind::Enforcement,
            limiter: limiter.to_string(),
            masked_key: "sha256:abcd...wxyz".to_string(),
            allowed: true,
            remaining: 1,
            reset_time_ms: 0,
            delay_ms: 0,
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn logs_first_k_then_samples() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        let pipeline = AuditPipeline::spawn(sink.clone(), 1000, 2, 5, 3600);
        for i in 0..12 {
            pipeline.offer(event("l1", i));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let logged = sink.events.lock().await.len();
        // first 2 logged in full, then every 5th of the remaining 10 => 2 more.
        assert_eq!(logged, 4, "expected 2 full + 2 sampled, got {logged}");
    }

    #[tokio::test]
    async fn system_failures_bypass_sampling() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        // full_log_per_minute=0 so every enforcement event would be sampled
        // away; system failures must still all get through.
        let pipeline = AuditPipeline::spawn(sink.clone(), 1000, 0, 1000, 3600);
        for i in 0..5 {
            let mut e = event("l1", i);
            e.kind = AuditEventKind::SystemFailure;
            pipeline.offer(e);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sink.events.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events_before_returning() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        let pipeline = AuditPipeline::spawn(sink.clone(), 1000, 1000, 1, 3600);
        for i in 0..20 {
            pipeline.offer(event("l1", i));
        }
        pipeline.shutdown(std::time::Duration::from_secs(1)).await;
        assert_eq!(sink.events.lock().await.len(), 20);
    }

    #[tokio::test]
    async fn offer_after_shutdown_is_dropped_not_panicked() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        let pipeline = AuditPipeline::spawn(sink, 10, 1000, 1, 3600);
        pipeline.shutdown(std::time::Duration::from_secs(1)).await;
        pipeline.offer(event("l1", 0));
        assert_eq!(pipeline.dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        let pipeline = AuditPipeline::spawn(sink, 1, 1000, 1, 3600);
        for i in 0..50 {
            pipeline.offer(event("l1", i));
        }
        assert!(pipeline.dropped.load(Ordering::Relaxed) > 0);
    }
}
