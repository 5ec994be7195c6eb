use super::AlgorithmParams;

/// `tokens` is a real-valued count in `[0, capacity]`; fractional tokens
/// accrue between calls and are never rounded until a caller asks for
/// `remaining()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_time: u64,
}

impl TokenBucketState {
    pub fn initial(params: &AlgorithmParams, now_ms: u64) -> Self {
        TokenBucketState {
            tokens: params.capacity as f64,
            last_refill_time: now_ms,
        }
    }

    pub fn try_consume(&self, params: &AlgorithmParams, cost: f64, now_ms: u64) -> (Self, bool) {
        let elapsed = now_ms.saturating_sub(self.last_refill_time) as f64;
        let available = (self.tokens + elapsed * params.refill_per_ms).min(params.capacity as f64);
        if available >= cost {
            (
                TokenBucketState {
                    tokens: available - cost,
                    last_refill_time: now_ms,
                },
                true,
            )
        } else {
            (
                TokenBucketState {
                    tokens: available,
                    last_refill_time: now_ms,
                },
                false,
            )
        }
    }

    pub fn remaining(&self, _params: &AlgorithmParams) -> u64 {
        self.tokens.floor() as u64
    }

    pub fn reset_time_ms(&self, params: &AlgorithmParams) -> u64 {
        if params.refill_per_ms <= 0.0 {
            return self.last_refill_time;
        }
        let deficit = (params.capacity as f64 - self.tokens).max(0.0);
        self.last_refill_time + (deficit / params.refill_per_ms).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_call_still_advances_refill_clock() {
        let p = AlgorithmParams {
            capacity: 1,
            refill_per_ms: 0.001,
            window_ms: 1000,
        };
        let s = TokenBucketState::initial(&p, 0);
        let (s1, ok1) = s.try_consume(&p, 1.0, 0);
        assert!(ok1);
        let (s2, ok2) = s1.try_consume(&p, 1.0, 10);
        assert!(!ok2);
        assert_eq!(s2.last_refill_time, 10);
    }

    #[test]
    fn refill_caps_at_capacity() {
        let p = AlgorithmParams {
            capacity: 10,
            refill_per_ms: 1.0,
            window_ms: 1000,
        };
        let s = TokenBucketState {
            tokens: 0.0,
            last_refill_time: 0,
        };
        let (s1, _) = s.try_consume(&p, 0.0, 1_000_000);
        assert_eq!(s1.tokens, 10.0);
    }
}
