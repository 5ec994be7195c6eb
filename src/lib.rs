//! Embeddable rate-limiting core.
//!
//! A host process links this crate, builds a [`config::RootConfig`], and
//! drives an [`engine::RateLimitEngine`] directly — there is no network
//! surface here, and no framework integration beyond the [`problem`]
//! module's RFC 7807 payload builder. The pieces compose as:
//!
//! ```text
//! engine::RateLimitEngine::try_acquire
//!     -> resolver::KeyResolver   (turn request attributes into a key)
//!     -> storage::Storage        (local / distributed / tiered state)
//!     -> throttle::decide        (adaptive delay on near-limit usage)
//!     -> audit::AuditPipeline    (non-blocking decision logging)
//! ```
//!
//! `algorithm` holds the three pure state-transition cores (token bucket,
//! sliding window, fixed window); `storage` composes them with persistence;
//! `config` is the hot-reloadable policy layer everything else reads from.

pub mod algorithm;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod mask;
pub mod metrics;
pub mod problem;
pub mod resolver;
pub mod storage;
pub mod throttle;

pub use engine::{Decision, RateLimitEngine};
pub use error::{RateLimitError, Result};
