//! Pure, allocation-free state-transition cores for the three supported
//! algorithms. Every function here takes the previous state plus a
//! timestamp and config, and returns the next state plus a decision — no
//! I/O, no locking, no clocks read internally. Storage (`crate::storage`)
//! owns persistence and concurrency; this module owns only the arithmetic.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindowState;
pub use sliding_window::SlidingWindowState;
pub use token_bucket::TokenBucketState;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// Algorithm-specific tunables. `capacity`/`limit` and `refill_rate`/`window_ms`
/// are aliased by name per algorithm but kept distinct here since their units
/// differ (tokens vs. requests, tokens-per-ms vs. a window duration).
#[derive(Debug, Clone, Copy)]
pub struct AlgorithmParams {
    pub capacity: u64,
    pub refill_per_ms: f64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketState {
    TokenBucket(TokenBucketState),
    SlidingWindow(SlidingWindowState),
    FixedWindow(FixedWindowState),
}

impl BucketState {
    pub fn initial(kind: AlgorithmKind, params: &AlgorithmParams, now_ms: u64) -> Self {
        match kind {
            AlgorithmKind::TokenBucket => {
                BucketState::TokenBucket(TokenBucketState::initial(params, now_ms))
            }
            AlgorithmKind::SlidingWindow => {
                BucketState::SlidingWindow(SlidingWindowState::initial(params, now_ms))
            }
            AlgorithmKind::FixedWindow => {
                BucketState::FixedWindow(FixedWindowState::initial(params, now_ms))
            }
        }
    }

    /// Attempt to consume `cost` units (tokens for token-bucket, requests for
    /// the window algorithms — `cost` is normally 1 there) at `now_ms`.
    /// Returns the next state and whether the request is allowed. A denied
    /// request for token bucket still advances `last_refill_time`, matching
    /// the teacher's bucket semantics: nobody loses accrued refill just
    /// because one caller was rejected.
    pub fn try_consume(
        &self,
        params: &AlgorithmParams,
        cost: u64,
        now_ms: u64,
    ) -> (BucketState, bool) {
        match self {
            BucketState::TokenBucket(s) => {
                let (next, allowed) = s.try_consume(params, cost as f64, now_ms);
                (BucketState::TokenBucket(next), allowed)
            }
            BucketState::SlidingWindow(s) => {
                let (next, allowed) = s.try_consume(params, now_ms);
                (BucketState::SlidingWindow(next), allowed)
            }
            BucketState::FixedWindow(s) => {
                let (next, allowed) = s.try_consume(params, now_ms);
                (BucketState::FixedWindow(next), allowed)
            }
        }
    }

    pub fn remaining(&self, params: &AlgorithmParams) -> u64 {
        match self {
            BucketState::TokenBucket(s) => s.remaining(params),
            BucketState::SlidingWindow(s) => s.remaining(params),
            BucketState::FixedWindow(s) => s.remaining(params),
        }
    }

    pub fn reset_time_ms(&self, params: &AlgorithmParams) -> u64 {
        match self {
            BucketState::TokenBucket(s) => s.reset_time_ms(params),
            BucketState::SlidingWindow(s) => s.reset_time_ms(params),
            BucketState::FixedWindow(s) => s.reset_time_ms(params),
        }
    }
}
