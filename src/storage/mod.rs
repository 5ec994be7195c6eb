//! Storage back-ends for algorithm state: a local, per-process tier (C2), a
//! distributed, cross-process tier (C3), and a tiered composition of the two
//! (C5) guarded by a circuit breaker (C4).

pub mod circuit_breaker;
pub mod distributed;
pub mod local;
pub mod scripts;
pub mod tiered;

pub use circuit_breaker::{BreakerCheck, CircuitBreakerRegistry};
pub use distributed::DistributedStore;
pub use local::LocalStore;
pub use tiered::TieredStore;

use crate::algorithm::{AlgorithmKind, AlgorithmParams};
use crate::error::Result;
use async_trait::async_trait;

/// Outcome of a single decision against stored algorithm state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time_ms: u64,
}

/// Implemented by anything that can hold algorithm state for a key and
/// atomically apply one `try_consume` step against it. Local, distributed,
/// and tiered stores are interchangeable behind this trait — the engine
/// (C7) does not know or care which one backs a given limiter.
///
/// `try_acquire`/`peek` are per-key and per-algorithm, matching how the
/// engine always has both in hand; `reset`/`is_healthy`/`current_time` are
/// the remaining operations from the external interface (spec §6) that the
/// demonstration binary and admin surfaces use directly.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn try_acquire(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        cost: u64,
        now_ms: u64,
    ) -> Result<StoreDecision>;

    /// Best-effort read of current state without consuming. Used for
    /// diagnostics and by the engine when a decision needs to be reported
    /// without having actually consumed (e.g. after a security rejection).
    async fn peek(
        &self,
        limiter: &str,
        key: &str,
        kind: AlgorithmKind,
        params: &AlgorithmParams,
        now_ms: u64,
    ) -> Result<StoreDecision>;

    /// Discard a key's state entirely. Best-effort: callers that need the
    /// next `try_acquire` to behave like a brand-new key should not assume
    /// `reset` itself is atomic with that following call.
    async fn reset(&self, limiter: &str, key: &str) -> Result<()>;

    /// Whether this tier can currently serve requests at all.
    async fn is_healthy(&self) -> bool;

    /// This tier's authoritative "now", in epoch milliseconds. Distributed
    /// tiers read the backend's wall clock to avoid cross-node skew; local
    /// tiers read the process clock.
    async fn current_time(&self) -> Result<u64>;
}
