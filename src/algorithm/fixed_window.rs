use super::AlgorithmParams;

/// Simplest and cheapest algorithm, at the cost of allowing up to `2*limit`
/// requests across a window boundary (half at the tail of one window, half
/// at the head of the next). `window_number` is `now / window_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedWindowState {
    pub window_number: u64,
    pub count: u64,
}

impl FixedWindowState {
    pub fn initial(params: &AlgorithmParams, now_ms: u64) -> Self {
        FixedWindowState {
            window_number: now_ms / params.window_ms.max(1),
            count: 0,
        }
    }

    pub fn try_consume(&self, params: &AlgorithmParams, now_ms: u64) -> (Self, bool) {
        let window_ms = params.window_ms.max(1);
        let wn = now_ms / window_ms;
        // A clock that runs backward between calls must not rewind the
        // window we're already in.
        let (window_number, count) = if wn > self.window_number {
            (wn, 0)
        } else {
            (self.window_number, self.count)
        };

        if count < params.capacity {
            (
                FixedWindowState {
                    window_number,
                    count: count + 1,
                },
                true,
            )
        } else {
            (
                FixedWindowState {
                    window_number,
                    count,
                },
                false,
            )
        }
    }

    pub fn remaining(&self, params: &AlgorithmParams) -> u64 {
        params.capacity.saturating_sub(self.count)
    }

    pub fn reset_time_ms(&self, params: &AlgorithmParams) -> u64 {
        (self.window_number + 1) * params.window_ms.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resets_exactly_at_window_boundary() {
        let p = AlgorithmParams {
            capacity: 2,
            refill_per_ms: 0.0,
            window_ms: 1000,
        };
        let s = FixedWindowState::initial(&p, 500);
        let (s1, ok1) = s.try_consume(&p, 500);
        let (s2, ok2) = s1.try_consume(&p, 999);
        let (s3, ok3) = s2.try_consume(&p, 999);
        assert!(ok1 && ok2 && !ok3);
        let (_, ok4) = s3.try_consume(&p, 1000);
        assert!(ok4, "new window at t=1000 must start with a fresh count");
    }

    #[test]
    fn clock_running_backward_does_not_rewind_window() {
        let p = AlgorithmParams {
            capacity: 1,
            refill_per_ms: 0.0,
            window_ms: 1000,
        };
        let s = FixedWindowState::initial(&p, 1500);
        let (s1, ok1) = s.try_consume(&p, 1500);
        assert!(ok1);
        let (s2, ok2) = s1.try_consume(&p, 1400);
        assert!(!ok2, "a stale timestamp must not open a fresh window");
        assert_eq!(s2.window_number, 1);
    }
}
