use thiserror::Error;

/// Top-level error taxonomy for the rate-limiting core.
///
/// A denied decision (`Decision { allowed: false, .. }`) is never represented
/// as an `Err` here — denial is a normal outcome of `try_acquire`, not a
/// failure. These variants cover conditions that prevent a decision from
/// being reached at all.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("key resolution rejected: {0}")]
    SecurityRejection(String),

    #[error("backend transient error ({limiter}): {source}")]
    BackendTransient {
        limiter: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("backend data error ({limiter}): {reason}")]
    BackendData { limiter: String, reason: String },

    #[error("circuit open for limiter {0}")]
    CircuitOpen(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RateLimitError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        RateLimitError::Configuration(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        RateLimitError::SecurityRejection(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RateLimitError::Internal(msg.into())
    }

    /// True for a network/connection-level L1 failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, RateLimitError::BackendTransient { .. })
    }

    /// True for anything that makes L1 unusable for this call: a transient
    /// connection failure or a malformed/unexpected reply from the backend.
    /// Both are indistinguishable from the circuit breaker's point of view
    /// — either way L1 did not produce a usable decision — so both record a
    /// breaker failure and trigger the same fail-open/fail-closed fallback.
    pub fn is_l1_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::BackendTransient { .. } | RateLimitError::BackendData { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RateLimitError>;
