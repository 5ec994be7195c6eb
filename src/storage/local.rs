use super::{Storage, StoreDecision};
use crate::algorithm::{AlgorithmKind, AlgorithmParams, BucketState};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Entries not accessed for this many milliseconds are eligible for eviction.
const GC_EXPIRE_MS: u64 = 300_000;
/// GC sweep interval.
const GC_INTERVAL_MS: u64 = 60_000;
/// Hard cap on entries per limiter. Beyond this, the oldest entries are
/// force-evicted regardless of last-access time.
const MAX_ENTRIES: usize = 100_000;

struct Entry {
    /// `tokio::sync::Mutex`, not a CAS loop: the token bucket's refill step
    /// reads and writes several fields together, and a CAS-only version of
    /// this let concurrent callers skip the refill entirely under
    /// contention, dropping the effective rate below what was configured.
    state: Mutex<BucketState>,
    last_access: AtomicU64,
}

/// In-process (L2) storage: one `DashMap` of bucket keys per limiter name,
/// each entry independently locked. This is the per-node tier a tiered
/// store falls back to when the distributed tier is unavailable.
pub struct LocalStore {
    limiters: DashMap<String, Arc<DashMap<String, Arc<Entry>>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        LocalStore {
            limiters: DashMap::new(),
        }
    }

    fn bucket_map(&self, limiter: &str) -> Arc<DashMap<String, Arc<Entry>>> {
        if let Some(m) = self.limiters.get(limiter) {
            return m.clone();
        }
        self.limiters
            .entry(limiter.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    fn entry(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        now_ms: u64,
    ) -> Arc<Entry> {
        let map = self.bucket_map(limiter);
        if let Some(e) = map.get(key) {
            return e.clone();
        }
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    state: Mutex::new(BucketState::initial(kind, params, now_ms)),
                    last_access: AtomicU64::new(now_ms),
                })
            })
            .clone();
        entry
    }

    /// Spawn a background sweep task. Call once per process; cheap to call
    /// more than once since each call just adds another ticking task, but
    /// callers should only do it at construction.
    pub fn start_gc(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(GC_INTERVAL_MS));
            loop {
                interval.tick().await;
                store.evict_stale(now_ms());
            }
        });
    }

    fn evict_stale(&self, now: u64) {
        for limiter_entry in self.limiters.iter() {
            let map = limiter_entry.value();
            map.retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < GC_EXPIRE_MS);
            if map.len() > MAX_ENTRIES {
                force_evict(map, now);
            }
        }
    }
}

fn force_evict(map: &DashMap<String, Arc<Entry>>, now: u64) {
    let overflow = map.len().saturating_sub(MAX_ENTRIES);
    if overflow == 0 {
        return;
    }
    let mut entries: Vec<(String, u64)> = map
        .iter()
        .map(|r| {
            let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
            (r.key().clone(), age)
        })
        .collect();
    entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
    for (key, _) in entries.into_iter().take(overflow) {
        map.remove(&key);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
impl Storage for LocalStore {
    async fn try_acquire(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        cost: u64,
        now_ms: u64,
    ) -> Result<StoreDecision> {
        let entry = self.entry(limiter, key, kind, params, now_ms);
        entry.last_access.store(now_ms, Ordering::Relaxed);
        let mut state = entry.state.lock().await;
        let (next, allowed) = state.try_consume(params, cost, now_ms);
        let remaining = next.remaining(params);
        let reset_time_ms = next.reset_time_ms(params);
        *state = next;
        Ok(StoreDecision {
            allowed,
            remaining,
            reset_time_ms,
        })
    }

    async fn peek(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        now_ms: u64,
    ) -> Result<StoreDecision> {
        let entry = self.entry(limiter, key, kind, params, now_ms);
        let state = entry.state.lock().await;
        Ok(StoreDecision {
            allowed: true,
            remaining: state.remaining(params),
            reset_time_ms: state.reset_time_ms(params),
        })
    }

    async fn reset(&self, limiter: &str, key: &str) -> Result<()> {
        if let Some(map) = self.limiters.get(limiter) {
            map.remove(key);
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn current_time(&self) -> Result<u64> {
        Ok(now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmKind;

    fn params(capacity: u64, window_ms: u64) -> AlgorithmParams {
        AlgorithmParams {
            capacity,
            refill_per_ms: capacity as f64 / window_ms as f64,
            window_ms,
        }
    }

    #[tokio::test]
    async fn allows_burst_then_throttles() {
        let store = LocalStore::new();
        let p = params(5, 1000);
        let mut allowed = 0;
        for _ in 0..10 {
            let d = store
                .try_acquire("l1", "k1", AlgorithmKind::TokenBucket, &p, 1, 0)
                .await
                .unwrap();
            allowed += d.allowed as u32;
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = LocalStore::new();
        let p = params(1, 1000);
        let a = store
            .try_acquire("l1", "a", AlgorithmKind::TokenBucket, &p, 1, 0)
            .await
            .unwrap();
        let b = store
            .try_acquire("l1", "b", AlgorithmKind::TokenBucket, &p, 1, 0)
            .await
            .unwrap();
        assert!(a.allowed && b.allowed);
    }

    #[tokio::test]
    async fn reset_then_acquire_behaves_like_a_fresh_key() {
        let store = LocalStore::new();
        let p = params(1, 1000);
        store
            .try_acquire("l1", "k", AlgorithmKind::TokenBucket, &p, 1, 0)
            .await
            .unwrap();
        assert!(!store
            .try_acquire("l1", "k", AlgorithmKind::TokenBucket, &p, 1, 0)
            .await
            .unwrap()
            .allowed);
        store.reset("l1", "k").await.unwrap();
        assert!(store
            .try_acquire("l1", "k", AlgorithmKind::TokenBucket, &p, 1, 0)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn gc_evicts_stale_entries() {
        let store = LocalStore::new();
        let p = params(1, 1000);
        store
            .try_acquire("l1", "stale", AlgorithmKind::TokenBucket, &p, 1, 0)
            .await
            .unwrap();
        store.evict_stale(GC_EXPIRE_MS + 1);
        let map = store.bucket_map("l1");
        assert!(map.is_empty());
    }
}
