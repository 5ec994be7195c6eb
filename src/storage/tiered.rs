use super::circuit_breaker::{BreakerCheck, CircuitBreakerRegistry};
use super::{DistributedStore, LocalStore, Storage, StoreDecision};
use crate::algorithm::{AlgorithmKind, AlgorithmParams, BucketState};
use crate::config::{CircuitBreakerConfig, FailStrategy};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Composes a distributed (L1) tier with a local (L2) fallback behind a
/// circuit breaker. This is the CAP trade-off made concrete: when L1 is
/// unreachable, `FailStrategy::FailOpen` degrades to L2's (per-node,
/// eventually-consistent-with-nothing) view rather than blocking traffic;
/// `FailStrategy::FailClosed` denies outright rather than risk a global
/// quota being exceeded by every node enforcing it independently.
pub struct TieredStore {
    l1: DistributedStore,
    l2: Arc<LocalStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_config: CircuitBreakerConfig,
    fail_strategy: FailStrategy,
}

impl TieredStore {
    pub fn new(
        l1: DistributedStore,
        l2: Arc<LocalStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        breaker_config: CircuitBreakerConfig,
        fail_strategy: FailStrategy,
    ) -> Self {
        TieredStore {
            l1,
            l2,
            breakers,
            breaker_config,
            fail_strategy,
        }
    }

    fn fallback_denied(&self, kind: AlgorithmKind, params: &AlgorithmParams, now_ms: u64) -> StoreDecision {
        let state = BucketState::initial(kind, params, now_ms);
        StoreDecision {
            allowed: false,
            remaining: 0,
            reset_time_ms: state.reset_time_ms(params),
        }
    }
}

#[async_trait]
impl Storage for TieredStore {
    async fn try_acquire(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        cost: u64,
        now_ms: u64,
    ) -> Result<StoreDecision> {
        match self.breakers.check(limiter, &self.breaker_config) {
            BreakerCheck::Rejected => match self.fail_strategy {
                FailStrategy::FailOpen => self.l2.try_acquire(limiter, key, kind, params, cost, now_ms).await,
                FailStrategy::FailClosed => Ok(self.fallback_denied(kind, params, now_ms)),
            },
            BreakerCheck::Allowed | BreakerCheck::Probe => {
                match self.l1.try_acquire(limiter, key, kind, params, cost, now_ms).await {
                    Ok(decision) => {
                        self.breakers.record_success(limiter, &self.breaker_config);
                        Ok(decision)
                    }
                    Err(e) if e.is_l1_failure() => {
                        self.breakers.record_failure(limiter, &self.breaker_config);
                        tracing::warn!(limiter, error = %e, "distributed tier unavailable, falling back");
                        match self.fail_strategy {
                            FailStrategy::FailOpen => {
                                self.l2.try_acquire(limiter, key, kind, params, cost, now_ms).await
                            }
                            FailStrategy::FailClosed => Ok(self.fallback_denied(kind, params, now_ms)),
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn peek(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        now_ms: u64,
    ) -> Result<StoreDecision> {
        match self.l1.peek(limiter, key, kind, params, now_ms).await {
            Ok(d) => Ok(d),
            Err(_) => self.l2.peek(limiter, key, kind, params, now_ms).await,
        }
    }

    /// Applies to both tiers best-effort: neither side's error is
    /// propagated, only logged, since a reset that only half-succeeds is
    /// still strictly better than one that aborts and does nothing.
    async fn reset(&self, limiter: &str, key: &str) -> Result<()> {
        if let Err(e) = self.l1.reset(limiter, key).await {
            tracing::warn!(limiter, error = %e, "tiered reset: L1 failed");
        }
        if let Err(e) = self.l2.reset(limiter, key).await {
            tracing::warn!(limiter, error = %e, "tiered reset: L2 failed");
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.l1.is_healthy().await && self.l2.is_healthy().await
    }

    async fn current_time(&self) -> Result<u64> {
        match self.l1.current_time().await {
            Ok(t) => Ok(t),
            Err(_) => self.l2.current_time().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;

    fn params() -> AlgorithmParams {
        AlgorithmParams {
            capacity: 5,
            refill_per_ms: 0.005,
            window_ms: 1000,
        }
    }

    #[tokio::test]
    async fn fails_open_to_local_when_redis_unreachable() {
        let l1 = DistributedStore::new("redis://127.0.0.1:1", 60_000).unwrap();
        let l2 = Arc::new(LocalStore::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let cb_cfg = CircuitBreakerConfig {
            enabled: true,
            failure_rate_threshold: 1.0,
            window_size: 5,
            base_timeout_ms: 60_000,
            jitter: 0.0,
            max_probes: 1,
            half_open_successes_to_close: 1,
        };
        let store = TieredStore::new(l1, l2, breakers, cb_cfg, FailStrategy::FailOpen);
        let decision = store
            .try_acquire("l1", "k", AlgorithmKind::TokenBucket, &params(), 1, 0)
            .await
            .unwrap();
        assert!(decision.allowed, "local fallback should allow the first request");
    }

    #[tokio::test]
    async fn fails_closed_denies_when_redis_unreachable() {
        let l1 = DistributedStore::new("redis://127.0.0.1:1", 60_000).unwrap();
        let l2 = Arc::new(LocalStore::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let cb_cfg = CircuitBreakerConfig {
            enabled: true,
            failure_rate_threshold: 1.0,
            window_size: 5,
            base_timeout_ms: 60_000,
            jitter: 0.0,
            max_probes: 1,
            half_open_successes_to_close: 1,
        };
        let store = TieredStore::new(l1, l2, breakers, cb_cfg, FailStrategy::FailClosed);
        let decision = store
            .try_acquire("l1", "k", AlgorithmKind::TokenBucket, &params(), 1, 0)
            .await
            .unwrap();
        assert!(!decision.allowed, "fail-closed must deny rather than risk over-admitting");
    }
}
