use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-limiter circuit breaker state machine: Closed -> Open -> HalfOpen ->
/// Closed/Open. Guards the distributed (L1) tier of a tiered store so a
/// struggling backend doesn't turn every request into a multi-second
/// timeout.
///
/// Unlike the teacher's per-node breaker (one per upstream host:port), this
/// is keyed by limiter name — each named policy gets its own breaker since
/// different limiters may point at different backends.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<LimiterBreaker>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

/// All fields that change together on a transition live behind one mutex.
/// An earlier CAS-only version of this (mirroring the token bucket) raced
/// the failure ring buffer against the state transition under concurrent
/// load; a single lock is simpler to reason about and breaker checks are
/// not the hot path token-bucket increments are.
struct Inner {
    state: State,
    outcomes: Vec<bool>, // true = failure, ring buffer of size window_size
    outcomes_pos: usize,
    opened_at: Option<Instant>,
    half_open_timeout: Duration,
    half_open_successes: u32,
    probes_in_flight: u32,
}

pub struct LimiterBreaker {
    inner: std::sync::Mutex<Inner>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    Allowed,
    Probe,
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        CircuitBreakerRegistry {
            breakers: DashMap::new(),
        }
    }

    pub fn check(&self, limiter: &str, config: &CircuitBreakerConfig) -> BreakerCheck {
        self.get_or_create(limiter, config).check()
    }

    pub fn record_success(&self, limiter: &str, config: &CircuitBreakerConfig) {
        self.get_or_create(limiter, config).record_success();
    }

    pub fn record_failure(&self, limiter: &str, config: &CircuitBreakerConfig) {
        self.get_or_create(limiter, config).record_failure();
    }

    pub fn is_open(&self, limiter: &str, config: &CircuitBreakerConfig) -> bool {
        matches!(self.check(limiter, config), BreakerCheck::Rejected)
    }

    fn get_or_create(&self, limiter: &str, config: &CircuitBreakerConfig) -> Arc<LimiterBreaker> {
        if let Some(entry) = self.breakers.get(limiter) {
            return entry.value().clone();
        }
        self.breakers
            .entry(limiter.to_string())
            .or_insert_with(|| Arc::new(LimiterBreaker::new(config.clone())))
            .clone()
    }

    pub fn retain_limiters(&self, active: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| active.contains(k));
    }
}

impl LimiterBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        let window_size = config.window_size.max(1) as usize;
        LimiterBreaker {
            inner: std::sync::Mutex::new(Inner {
                state: State::Closed,
                outcomes: Vec::with_capacity(window_size),
                outcomes_pos: 0,
                opened_at: None,
                half_open_timeout: Duration::from_millis(config.base_timeout_ms),
                half_open_successes: 0,
                probes_in_flight: 0,
            }),
            config,
        }
    }

    /// `T_base * (1 +/- J * U(-1,1))`: spreads concurrent callers' retries
    /// across a window instead of all probing the instant the timer expires.
    fn jittered_timeout(&self) -> Duration {
        let j = self.config.jitter.clamp(0.0, 1.0);
        let u: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let factor = (1.0 + j * u).max(0.0);
        Duration::from_millis((self.config.base_timeout_ms as f64 * factor) as u64)
    }

    fn check(&self) -> BreakerCheck {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => BreakerCheck::Allowed,
            State::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < inner.half_open_timeout {
                    return BreakerCheck::Rejected;
                }
                inner.state = State::HalfOpen;
                inner.half_open_successes = 0;
                inner.probes_in_flight = 1;
                tracing::info!("circuit_breaker: half-open, admitting probe");
                BreakerCheck::Probe
            }
            State::HalfOpen => {
                if inner.probes_in_flight < self.config.max_probes {
                    inner.probes_in_flight += 1;
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
        }
    }

    fn record_outcome(&self, inner: &mut Inner, failure: bool) {
        let cap = self.config.window_size.max(1) as usize;
        if inner.outcomes.len() < cap {
            inner.outcomes.push(failure);
        } else {
            inner.outcomes[inner.outcomes_pos] = failure;
        }
        inner.outcomes_pos = (inner.outcomes_pos + 1) % cap;
    }

    /// Trips once `failures / (failures + successes) >= F` over the
    /// outcomes observed so far this window (not the window's full
    /// capacity, so a breaker with a handful of failures and no successes
    /// yet doesn't have to wait for the ring buffer to fill up first).
    fn failure_rate_tripped(&self, inner: &Inner) -> bool {
        let total = inner.outcomes.len();
        if total == 0 {
            return false;
        }
        let failures = inner.outcomes.iter().filter(|f| **f).count();
        (failures as f64 / total as f64) >= self.config.failure_rate_threshold
    }

    fn trip_open(&self, inner: &mut Inner) {
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_timeout = self.jittered_timeout();
        inner.probes_in_flight = 0;
        metrics::counter!("ratekeeper_breaker_trips_total").increment(1);
        tracing::warn!(timeout_ms = ?inner.half_open_timeout, "circuit_breaker: opened");
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => self.record_outcome(&mut inner, false),
            State::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_successes_to_close {
                    inner.state = State::Closed;
                    inner.outcomes.clear();
                    inner.outcomes_pos = 0;
                    tracing::info!("circuit_breaker: closed (recovered)");
                }
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                self.record_outcome(&mut inner, true);
                if self.failure_rate_tripped(&inner) {
                    self.trip_open(&mut inner);
                }
            }
            State::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                self.trip_open(&mut inner);
            }
            State::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(failure_rate_threshold: f64, window: u32, timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_rate_threshold,
            window_size: window,
            base_timeout_ms: timeout_ms,
            jitter: 0.0,
            max_probes: 1,
            half_open_successes_to_close: 1,
        }
    }

    #[test]
    fn starts_closed() {
        let reg = CircuitBreakerRegistry::new();
        assert_eq!(reg.check("l1", &cfg(0.5, 10, 1000)), BreakerCheck::Allowed);
    }

    #[test]
    fn trips_once_failure_rate_reaches_threshold() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(0.5, 10, 60_000);
        reg.record_success("l1", &c);
        reg.record_success("l1", &c);
        reg.record_failure("l1", &c);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Allowed, "1/3 failures is below the 0.5 threshold");
        reg.record_failure("l1", &c);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Rejected, "2/4 failures reaches the 0.5 threshold");
    }

    #[test]
    fn low_failure_rate_never_trips() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(0.5, 10, 60_000);
        for _ in 0..8 {
            reg.record_success("l1", &c);
        }
        reg.record_failure("l1", &c);
        reg.record_failure("l1", &c);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Allowed, "2/10 failures stays under the 0.5 threshold");
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(0.5, 10, 0);
        reg.record_failure("l1", &c);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(reg.check("l1", &c), BreakerCheck::Probe);
        reg.record_success("l1", &c);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Allowed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(0.5, 10, 0);
        reg.record_failure("l1", &c);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = reg.check("l1", &c);
        reg.record_failure("l1", &c);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Rejected);
    }

    #[test]
    fn bounded_concurrent_probes() {
        let reg = CircuitBreakerRegistry::new();
        let mut c = cfg(0.5, 10, 0);
        c.max_probes = 2;
        reg.record_failure("l1", &c);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(reg.check("l1", &c), BreakerCheck::Probe);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Probe);
        assert_eq!(reg.check("l1", &c), BreakerCheck::Rejected);
    }
}
