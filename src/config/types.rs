use crate::algorithm::AlgorithmKind;
use crate::error::{RateLimitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

/// Behavior when the distributed (L1) tier is unreachable: CAP trade-off
/// made explicit per limiter rather than globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailStrategy {
    /// Prefer availability: fall back to the local (L2) tier's own decision.
    #[default]
    FailOpen,
    /// Prefer consistency: deny requests the local tier cannot confidently allow.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleCurve {
    #[default]
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Fraction of capacity (0.0-1.0) at which delay starts being applied.
    pub soft_threshold: f64,
    /// Fraction of capacity (0.0-1.0) at which delay reaches `max_delay_ms`.
    pub hard_threshold: f64,
    pub curve: ThrottleCurve,
    pub max_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            enabled: false,
            soft_threshold: 0.7,
            hard_threshold: 0.95,
            curve: ThrottleCurve::Linear,
            max_delay_ms: 250,
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.soft_threshold) || !(0.0..=1.0).contains(&self.hard_threshold)
        {
            return Err(RateLimitError::configuration(
                "throttle thresholds must be within [0.0, 1.0]",
            ));
        }
        if self.soft_threshold > self.hard_threshold {
            return Err(RateLimitError::configuration(
                "throttle soft_threshold must not exceed hard_threshold",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failure rate `F` over the most recent `window_size` outcomes: trips
    /// open once `failures / (failures + successes) >= F`.
    pub failure_rate_threshold: f64,
    pub window_size: u32,
    pub base_timeout_ms: u64,
    /// Jitter fraction `J` applied to the half-open timeout: `T_base * (1 +/- J * U(-1,1))`.
    pub jitter: f64,
    /// Max concurrent half-open probes `P`.
    pub max_probes: u32,
    pub half_open_successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: true,
            failure_rate_threshold: 0.5,
            window_size: 20,
            base_timeout_ms: 30_000,
            jitter: 0.2,
            max_probes: 1,
            half_open_successes_to_close: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(RateLimitError::configuration(
                "circuit_breaker.failure_rate_threshold must be within [0.0, 1.0]",
            ));
        }
        if self.window_size == 0 {
            return Err(RateLimitError::configuration(
                "circuit_breaker.window_size must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RateLimitError::configuration(
                "circuit_breaker.jitter must be within [0.0, 1.0]",
            ));
        }
        if self.max_probes == 0 {
            return Err(RateLimitError::configuration(
                "circuit_breaker.max_probes must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Local,
    Distributed,
    Tiered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub redis_url: Option<String>,
    pub fail_strategy: FailStrategy,
    #[serde(rename = "circuit_breaker")]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Local clock cache window: how long a cached "now" value (read once per
    /// tick) may be reused before a fresh syscall/backend round-trip happens.
    pub clock_cache_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            mode: StorageMode::Local,
            redis_url: None,
            fail_strategy: FailStrategy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            clock_cache_ms: 100,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if matches!(self.mode, StorageMode::Distributed | StorageMode::Tiered) && self.redis_url.is_none()
        {
            return Err(RateLimitError::configuration(
                "storage.redis_url is required when mode is distributed or tiered",
            ));
        }
        self.circuit_breaker.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Key template, e.g. `"user:#user[id]"`. No marker char present means
    /// the template is used verbatim (the fast path).
    pub key_template: String,
    pub cache_capacity: usize,
    pub max_expression_len: usize,
    pub max_bracket_depth: u32,
    pub extra_blacklist: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            key_template: String::new(),
            cache_capacity: 1_000,
            max_expression_len: 500,
            max_bracket_depth: 10,
            extra_blacklist: Vec::new(),
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        // An empty template is a valid policy — it resolves to the literal
        // "global" key, scoping the limiter to all callers rather than per-key.
        if self.max_expression_len == 0 {
            return Err(RateLimitError::configuration(
                "resolver.max_expression_len must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
    /// Log the first K denial events per limiter per minute in full.
    pub full_log_per_minute: u32,
    /// After the first K, log 1 in every S subsequent events.
    pub sample_rate: u32,
    pub summary_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            enabled: true,
            queue_capacity: 10_000,
            full_log_per_minute: 20,
            sample_rate: 100,
            summary_interval_secs: 60,
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(RateLimitError::configuration(
                "audit.queue_capacity must be > 0",
            ));
        }
        if self.sample_rate == 0 {
            return Err(RateLimitError::configuration(
                "audit.sample_rate must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemDetailsConfig {
    pub type_base_url: String,
    pub instance_prefix: String,
}

impl Default for ProblemDetailsConfig {
    fn default() -> Self {
        ProblemDetailsConfig {
            type_base_url: "https://errors.example.internal/rate-limit".to_string(),
            instance_prefix: "/requests/".to_string(),
        }
    }
}

/// A single named rate-limiting policy: one algorithm, one set of tunables,
/// one key-resolution template. The registry (`crate::config::RootConfig`)
/// holds many of these, swapped in atomically on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub name: String,
    pub algorithm: AlgorithmKind,
    /// Request limit N: the window algorithms' admission count, and the
    /// token bucket's default capacity/refill basis.
    pub capacity: u64,
    pub window_ms: u64,
    /// Token bucket capacity C. `None` defaults to `capacity` (N), matching
    /// the common case where the bucket holds exactly the request limit.
    /// Ignored by the window algorithms, where `capacity` (N) is already
    /// the only admission ceiling.
    pub token_capacity: Option<u64>,
    /// Token bucket refill rate R, tokens per millisecond. `None` defaults
    /// to `capacity / window_ms` (N/W). Ignored by the window algorithms.
    pub refill_rate_per_ms: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub throttle: ThrottleConfig,
    pub resolver: ResolverConfig,
    pub storage: StorageConfig,
    pub audit: AuditConfig,
    pub problem_details: ProblemDetailsConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            name: String::new(),
            algorithm: AlgorithmKind::TokenBucket,
            capacity: 100,
            window_ms: 60_000,
            token_capacity: None,
            refill_rate_per_ms: None,
            enabled: true,
            throttle: ThrottleConfig::default(),
            resolver: ResolverConfig::default(),
            storage: StorageConfig::default(),
            audit: AuditConfig::default(),
            problem_details: ProblemDetailsConfig::default(),
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RateLimitError::configuration("limiter.name must not be empty"));
        }
        if self.capacity == 0 {
            return Err(RateLimitError::configuration(format!(
                "limiter '{}': capacity must be > 0",
                self.name
            )));
        }
        if self.window_ms == 0 {
            return Err(RateLimitError::configuration(format!(
                "limiter '{}': window_ms must be > 0",
                self.name
            )));
        }
        if self.algorithm == AlgorithmKind::SlidingWindow && self.window_ms < 1000 {
            return Err(RateLimitError::configuration(format!(
                "limiter '{}': sliding window requires window_ms >= 1000",
                self.name
            )));
        }
        if let Some(c) = self.token_capacity {
            if c == 0 {
                return Err(RateLimitError::configuration(format!(
                    "limiter '{}': token_capacity must be > 0",
                    self.name
                )));
            }
        }
        if let Some(r) = self.refill_rate_per_ms {
            if r <= 0.0 {
                return Err(RateLimitError::configuration(format!(
                    "limiter '{}': refill_rate_per_ms must be > 0",
                    self.name
                )));
            }
        }
        self.throttle.validate()?;
        self.resolver.validate()?;
        self.storage.validate()?;
        self.audit.validate()?;
        Ok(())
    }

    /// Effective token bucket capacity C, defaulting to the request limit N.
    pub fn token_bucket_capacity(&self) -> u64 {
        self.token_capacity.unwrap_or(self.capacity)
    }

    /// Effective token bucket refill rate R, defaulting to N/W.
    pub fn refill_per_ms(&self) -> f64 {
        self.refill_rate_per_ms
            .unwrap_or(self.capacity as f64 / self.window_ms as f64)
    }
}

/// Top-level configuration file: a named set of limiter policies. Hot
/// reload replaces the whole map atomically (`ArcSwap<RootConfig>`) so a
/// decision in flight always sees a fully-validated, internally consistent
/// snapshot — never half of an old config and half of a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RootConfig {
    pub limiters: HashMap<String, LimiterConfig>,
}

impl RootConfig {
    pub fn validate(&self) -> Result<()> {
        for (key, limiter) in &self.limiters {
            if key != &limiter.name && !limiter.name.is_empty() {
                return Err(RateLimitError::configuration(format!(
                    "limiter map key '{key}' does not match limiter.name '{}'",
                    limiter.name
                )));
            }
            limiter.validate()?;
        }
        Ok(())
    }
}
