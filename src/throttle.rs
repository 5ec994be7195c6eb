//! Adaptive throttling (C8): adds an artificial delay to *allowed* decisions
//! as usage approaches the limit, smoothing traffic instead of letting it
//! run flat-out right up to the point a request is denied. Denied decisions
//! are never delayed — a caller that's already being rejected gains nothing
//! from also waiting.

use crate::config::{ThrottleConfig, ThrottleCurve};

/// Fraction of capacity in use, in `[0.0, 1.0]`, derived from remaining/capacity.
pub fn usage_fraction(remaining: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return 1.0;
    }
    (1.0 - (remaining as f64 / capacity as f64)).clamp(0.0, 1.0)
}

/// Delay in milliseconds to apply to an allowed request at the given usage
/// level. Zero below `soft_threshold`, ramping to `max_delay_ms` at
/// `hard_threshold` along the configured curve, clamped at `max_delay_ms`
/// beyond it.
pub fn delay_ms(usage: f64, config: &ThrottleConfig) -> u64 {
    if !config.enabled || usage < config.soft_threshold {
        return 0;
    }
    let span = (config.hard_threshold - config.soft_threshold).max(f64::EPSILON);
    let t = ((usage - config.soft_threshold) / span).clamp(0.0, 1.0);
    let factor = match config.curve {
        ThrottleCurve::Linear => t,
        ThrottleCurve::Exponential => t * t,
    };
    (factor * config.max_delay_ms as f64).round() as u64
}

/// Outcome of the standalone throttle decision: either admit (with a delay
/// the caller applies before proceeding) or reject outright. `usage` and
/// the thresholds share whatever unit the caller picked — a fraction of
/// capacity, a raw request count, anything monotonic in the same scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleDecision {
    Allow { delay_ms: u64 },
    Reject,
}

/// The three-way rule from the spec: at or above `hard`, reject outright
/// rather than merely delaying at `max_delay_ms` forever — a caller stuck
/// at the ceiling should see a rejection, not an ever-longer wait.
pub fn decide(usage: f64, config: &ThrottleConfig) -> ThrottleDecision {
    if config.enabled && usage >= config.hard_threshold {
        return ThrottleDecision::Reject;
    }
    ThrottleDecision::Allow {
        delay_ms: delay_ms(usage, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(curve: ThrottleCurve) -> ThrottleConfig {
        ThrottleConfig {
            enabled: true,
            soft_threshold: 0.5,
            hard_threshold: 1.0,
            curve,
            max_delay_ms: 100,
        }
    }

    #[test]
    fn no_delay_below_soft_threshold() {
        assert_eq!(delay_ms(0.4, &cfg(ThrottleCurve::Linear)), 0);
    }

    #[test]
    fn max_delay_at_or_above_hard_threshold() {
        assert_eq!(delay_ms(1.0, &cfg(ThrottleCurve::Linear)), 100);
        assert_eq!(delay_ms(1.5, &cfg(ThrottleCurve::Linear)), 100);
    }

    #[test]
    fn exponential_curve_delays_less_in_the_middle() {
        let linear = delay_ms(0.75, &cfg(ThrottleCurve::Linear));
        let exp = delay_ms(0.75, &cfg(ThrottleCurve::Exponential));
        assert!(exp < linear, "exponential curve should lag linear before the hard threshold");
    }

    #[test]
    fn disabled_never_delays() {
        let mut c = cfg(ThrottleCurve::Linear);
        c.enabled = false;
        assert_eq!(delay_ms(1.0, &c), 0);
    }

    fn scenario_e_cfg(curve: ThrottleCurve) -> ThrottleConfig {
        ThrottleConfig {
            enabled: true,
            soft_threshold: 80.0,
            hard_threshold: 100.0,
            curve,
            max_delay_ms: 2000,
        }
    }

    #[test]
    fn scenario_e_linear() {
        let c = scenario_e_cfg(ThrottleCurve::Linear);
        assert_eq!(decide(70.0, &c), ThrottleDecision::Allow { delay_ms: 0 });
        assert_eq!(decide(90.0, &c), ThrottleDecision::Allow { delay_ms: 1000 });
        assert_eq!(decide(100.0, &c), ThrottleDecision::Reject);
    }

    #[test]
    fn scenario_e_exponential() {
        let c = scenario_e_cfg(ThrottleCurve::Exponential);
        assert_eq!(decide(90.0, &c), ThrottleDecision::Allow { delay_ms: 500 });
        assert_eq!(decide(95.0, &c), ThrottleDecision::Allow { delay_ms: 1125 });
    }
}
