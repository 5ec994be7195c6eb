//! Orchestration (C7): the single entry point, `try_acquire`, that strings
//! together key resolution, storage, adaptive throttling, and auditing for
//! one named limiter. Everything else in this crate exists to be composed
//! here.

use crate::algorithm::AlgorithmParams;
use crate::audit::{AuditEvent, AuditEventKind, AuditPipeline, AuditSink};
use crate::config::{FailStrategy, LimiterConfig, RootConfig, StorageMode};
use crate::error::{RateLimitError, Result};
use crate::mask::mask_key;
use crate::resolver::{KeyResolver, ResolveContext};
use crate::storage::{CircuitBreakerRegistry, DistributedStore, LocalStore, Storage, StoreDecision, TieredStore};
use crate::throttle;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

/// Final outcome of one `try_acquire` call, independent of which algorithm
/// or storage tier produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub limiter: String,
    pub allowed: bool,
    pub capacity: u64,
    pub remaining: u64,
    pub reset_time_ms: u64,
    pub delay_ms: u64,
}

pub struct RateLimitEngine {
    config: ArcSwap<RootConfig>,
    resolver: Arc<DashMap<String, Arc<KeyResolver>>>,
    stores: DashMap<String, Arc<dyn Storage>>,
    breakers: Arc<CircuitBreakerRegistry>,
    local: Arc<LocalStore>,
    audit: Arc<AuditPipeline>,
}

impl RateLimitEngine {
    pub fn new(config: RootConfig, audit_sink: Arc<dyn AuditSink>) -> Arc<Self> {
        let local = Arc::new(LocalStore::new());
        local.start_gc();

        // A single pipeline for the whole engine: per-limiter sampling
        // parameters are read from whichever limiter's config is active
        // when a given limiter first sends, which is good enough since
        // these knobs rarely change across a reload.
        let default_audit = config
            .limiters
            .values()
            .next()
            .map(|l| l.audit.clone())
            .unwrap_or_default();
        let audit = Arc::new(AuditPipeline::spawn(
            audit_sink,
            default_audit.queue_capacity,
            default_audit.full_log_per_minute,
            default_audit.sample_rate,
            default_audit.summary_interval_secs,
        ));

        Arc::new(RateLimitEngine {
            config: ArcSwap::from_pointee(config),
            resolver: Arc::new(DashMap::new()),
            stores: DashMap::new(),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            local,
            audit,
        })
    }

    /// Atomically swap in a new policy set. In-flight calls keep using the
    /// snapshot they already loaded; new calls see the new one immediately.
    /// Per-limiter storage state is not migrated across a reload — a
    /// limiter whose storage mode changes starts from a fresh bucket.
    pub fn reload(&self, config: RootConfig) {
        self.config.store(Arc::new(config));
        self.stores.clear();
        metrics::counter!("ratekeeper_config_reloads_total").increment(1);
    }

    fn storage_for(&self, limiter: &LimiterConfig) -> Result<Arc<dyn Storage>> {
        if let Some(store) = self.stores.get(&limiter.name) {
            return Ok(store.clone());
        }

        let store: Arc<dyn Storage> = match limiter.storage.mode {
            StorageMode::Local => self.local.clone(),
            StorageMode::Distributed => {
                let url = limiter.storage.redis_url.as_deref().ok_or_else(|| {
                    RateLimitError::configuration(format!(
                        "limiter '{}': distributed mode requires storage.redis_url",
                        limiter.name
                    ))
                })?;
                Arc::new(DistributedStore::new(url, redis_key_ttl_ms(limiter))?)
            }
            StorageMode::Tiered => {
                let url = limiter.storage.redis_url.as_deref().ok_or_else(|| {
                    RateLimitError::configuration(format!(
                        "limiter '{}': tiered mode requires storage.redis_url",
                        limiter.name
                    ))
                })?;
                let l1 = DistributedStore::new(url, redis_key_ttl_ms(limiter))?;
                Arc::new(TieredStore::new(
                    l1,
                    self.local.clone(),
                    self.breakers.clone(),
                    limiter.storage.circuit_breaker.clone(),
                    limiter.storage.fail_strategy,
                ))
            }
        };

        self.stores.insert(limiter.name.clone(), store.clone());
        Ok(store)
    }

    fn resolver_for(&self, limiter: &LimiterConfig) -> Arc<KeyResolver> {
        if let Some(r) = self.resolver.get(&limiter.name) {
            return r.clone();
        }
        self.resolver
            .entry(limiter.name.clone())
            .or_insert_with(|| Arc::new(KeyResolver::new(limiter.resolver.cache_capacity)))
            .clone()
    }

    /// The six-step decision flow: look up policy, resolve key, consult
    /// storage, apply throttling, audit, return.
    pub async fn try_acquire(
        &self,
        limiter_name: &str,
        ctx: &ResolveContext,
        cost: u64,
        now_ms: u64,
    ) -> Result<Decision> {
        let snapshot = self.config.load();
        let limiter = snapshot
            .limiters
            .get(limiter_name)
            .ok_or_else(|| RateLimitError::configuration(format!("unknown limiter '{limiter_name}'")))?;

        if !limiter.enabled {
            return Ok(Decision {
                limiter: limiter_name.to_string(),
                allowed: true,
                capacity: limiter.capacity,
                remaining: limiter.capacity,
                reset_time_ms: now_ms,
                delay_ms: 0,
            });
        }

        // Resolver errors (a security rejection, or a genuine bug in a
        // template) must never take the whole request down with them — the
        // engine recovers by pinning the request to a shared anonymous
        // bucket rather than propagating the error to the caller.
        let key = match self
            .resolver_for(limiter)
            .resolve(&limiter.resolver.key_template, ctx, &limiter.resolver)
        {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(limiter = %limiter.name, error = %e, "key resolution failed, falling back to global-anonymous");
                "global-anonymous".to_string()
            }
        };

        let params = AlgorithmParams {
            capacity: match limiter.algorithm {
                crate::algorithm::AlgorithmKind::TokenBucket => limiter.token_bucket_capacity(),
                _ => limiter.capacity,
            },
            refill_per_ms: limiter.refill_per_ms(),
            window_ms: limiter.window_ms,
        };

        let store = self.storage_for(limiter)?;
        let started = std::time::Instant::now();
        let store_result = store
            .try_acquire(&limiter.name, &key, limiter.algorithm, &params, cost, now_ms)
            .await;
        metrics::histogram!("ratekeeper_decision_duration_seconds", "limiter" => limiter.name.clone())
            .record(started.elapsed().as_secs_f64());

        let store_decision = match store_result {
            Ok(d) => d,
            Err(e) => {
                // A storage exception never escapes try_acquire: the fail
                // strategy synthesizes a decision in its place, same as the
                // tiered store's own L1-unavailable handling, for limiters
                // whose storage mode has no circuit breaker of its own.
                tracing::warn!(limiter = %limiter.name, error = %e, "storage error, applying fail strategy");
                metrics::counter!("ratekeeper_storage_errors_total", "limiter" => limiter.name.clone()).increment(1);
                self.emit_event(
                    limiter,
                    AuditEventKind::SystemFailure,
                    &key,
                    limiter.storage.fail_strategy == FailStrategy::FailOpen,
                    0,
                    now_ms,
                    0,
                    now_ms,
                );
                match limiter.storage.fail_strategy {
                    FailStrategy::FailOpen => StoreDecision {
                        allowed: true,
                        remaining: limiter.capacity.saturating_sub(1),
                        reset_time_ms: now_ms + limiter.window_ms,
                    },
                    FailStrategy::FailClosed => StoreDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time_ms: now_ms + limiter.window_ms,
                    },
                }
            }
        };

        let (allowed, delay_ms) = if store_decision.allowed {
            let usage = throttle::usage_fraction(store_decision.remaining, limiter.capacity);
            match throttle::decide(usage, &limiter.throttle) {
                throttle::ThrottleDecision::Allow { delay_ms } => (true, delay_ms),
                // The algorithm already admitted this request, but usage has
                // crossed the throttler's hard ceiling: prefer rejecting
                // over handing back an ever-longer delay.
                throttle::ThrottleDecision::Reject => (false, 0),
            }
        } else {
            (false, 0)
        };

        metrics::counter!(
            "ratekeeper_decisions_total",
            "limiter" => limiter.name.clone(),
            "outcome" => if allowed { "allow" } else { "deny" },
        )
        .increment(1);
        if delay_ms > 0 {
            metrics::counter!("ratekeeper_throttle_delays_total", "limiter" => limiter.name.clone()).increment(1);
        }

        self.emit_event(
            limiter,
            AuditEventKind::Enforcement,
            &key,
            allowed,
            store_decision.remaining,
            store_decision.reset_time_ms,
            delay_ms,
            now_ms,
        );

        Ok(Decision {
            limiter: limiter.name.clone(),
            allowed,
            capacity: limiter.capacity,
            remaining: store_decision.remaining,
            reset_time_ms: store_decision.reset_time_ms,
            delay_ms,
        })
    }

    /// Read the engine's best current-time source for a limiter: the
    /// storage layer's authoritative clock, per §6's `current_time`
    /// operation (distributed tiers defer to the backend's wall clock to
    /// avoid cross-node skew; local falls back to the process clock).
    pub async fn current_time(&self, limiter_name: &str) -> Result<u64> {
        let snapshot = self.config.load();
        let limiter = snapshot
            .limiters
            .get(limiter_name)
            .ok_or_else(|| RateLimitError::configuration(format!("unknown limiter '{limiter_name}'")))?;
        self.storage_for(limiter)?.current_time().await
    }

    pub async fn reset(&self, limiter_name: &str, key: &str) -> Result<()> {
        let snapshot = self.config.load();
        let limiter = snapshot
            .limiters
            .get(limiter_name)
            .ok_or_else(|| RateLimitError::configuration(format!("unknown limiter '{limiter_name}'")))?;
        self.storage_for(limiter)?.reset(&limiter.name, key).await
    }

    pub async fn is_healthy(&self, limiter_name: &str) -> bool {
        let snapshot = self.config.load();
        match snapshot.limiters.get(limiter_name) {
            Some(limiter) => match self.storage_for(limiter) {
                Ok(store) => store.is_healthy().await,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Drains the audit queue and stops its background consumer, waiting at
    /// most `timeout` before forcing a stop. Call this once, during process
    /// shutdown, after the last `try_acquire` has returned.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.audit.shutdown(timeout).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_event(
        &self,
        limiter: &LimiterConfig,
        kind: AuditEventKind,
        key: &str,
        allowed: bool,
        remaining: u64,
        reset_time_ms: u64,
        delay_ms: u64,
        now_ms: u64,
    ) {
        if !limiter.audit.enabled {
            return;
        }
        self.audit.offer(AuditEvent {
            kind,
            limiter: limiter.name.clone(),
            masked_key: mask_key(key),
            allowed,
            remaining,
            reset_time_ms,
            delay_ms,
            timestamp_ms: now_ms,
        });
    }
}

/// State idle beyond several window lengths is almost certainly abandoned;
/// letting Redis expire it keeps a shared backend from accumulating keys
/// for clients that never come back.
fn redis_key_ttl_ms(limiter: &LimiterConfig) -> u64 {
    limiter.window_ms.saturating_mul(4).max(60_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmKind;
    use crate::audit::NoopSink;
    use crate::config::{LimiterConfig, ResolverConfig};
    use std::collections::HashMap;

    fn test_config(name: &str, capacity: u64, window_ms: u64) -> RootConfig {
        let mut limiters = HashMap::new();
        limiters.insert(
            name.to_string(),
            LimiterConfig {
                name: name.to_string(),
                algorithm: AlgorithmKind::TokenBucket,
                capacity,
                window_ms,
                resolver: ResolverConfig {
                    key_template: "static".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        RootConfig { limiters }
    }

    #[tokio::test]
    async fn allows_then_denies_burst() {
        let engine = RateLimitEngine::new(test_config("l1", 3, 1000), Arc::new(NoopSink));
        let ctx = ResolveContext::default();
        let mut allowed = 0;
        for _ in 0..5 {
            let d = engine.try_acquire("l1", &ctx, 1, 0).await.unwrap();
            allowed += d.allowed as u32;
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn unknown_limiter_is_a_configuration_error() {
        let engine = RateLimitEngine::new(test_config("l1", 3, 1000), Arc::new(NoopSink));
        let ctx = ResolveContext::default();
        let err = engine.try_acquire("missing", &ctx, 1, 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Configuration(_)));
    }

    #[tokio::test]
    async fn reload_replaces_policy_atomically() {
        let engine = RateLimitEngine::new(test_config("l1", 1, 1000), Arc::new(NoopSink));
        let ctx = ResolveContext::default();
        assert!(engine.try_acquire("l1", &ctx, 1, 0).await.unwrap().allowed);
        assert!(!engine.try_acquire("l1", &ctx, 1, 0).await.unwrap().allowed);

        engine.reload(test_config("l1", 10, 1000));
        assert!(engine.try_acquire("l1", &ctx, 1, 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn shutdown_completes_without_hanging() {
        let engine = RateLimitEngine::new(test_config("l1", 3, 1000), Arc::new(NoopSink));
        let ctx = ResolveContext::default();
        engine.try_acquire("l1", &ctx, 1, 0).await.unwrap();
        engine.shutdown(std::time::Duration::from_secs(1)).await;
    }
}
