use super::AlgorithmParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub window_start: u64,
    pub count: u64,
}

/// Weighted two-window estimator, same approach Cloudflare/Envoy use to
/// approximate a true sliding window without storing a timestamp per
/// request: the previous window's count is discounted by how much of it
/// has "rolled off" into the current window.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindowState {
    pub current: Window,
    pub previous: Option<Window>,
}

impl SlidingWindowState {
    pub fn initial(params: &AlgorithmParams, now_ms: u64) -> Self {
        let cws = window_start(now_ms, params.window_ms);
        SlidingWindowState {
            current: Window {
                window_start: cws,
                count: 0,
            },
            previous: None,
        }
    }

    pub fn try_consume(&self, params: &AlgorithmParams, now_ms: u64) -> (Self, bool) {
        let window_ms = params.window_ms.max(1);
        let cws = window_start(now_ms, window_ms);
        let (current, previous) = self.roll(cws, window_ms);

        let elapsed_in_current = now_ms.saturating_sub(cws) as f64;
        let weight = match &previous {
            Some(_) => ((window_ms as f64 - elapsed_in_current) / window_ms as f64).clamp(0.0, 1.0),
            None => 0.0,
        };
        let prev_count = previous.as_ref().map(|w| w.count).unwrap_or(0);
        let estimated = prev_count as f64 * weight + current.count as f64;

        if estimated < params.capacity as f64 {
            let mut next_current = current;
            next_current.count += 1;
            (
                SlidingWindowState {
                    current: next_current,
                    previous,
                },
                true,
            )
        } else {
            (
                SlidingWindowState { current, previous },
                false,
            )
        }
    }

    fn roll(&self, cws: u64, window_ms: u64) -> (Window, Option<Window>) {
        if self.current.window_start == cws {
            return (self.current, self.previous);
        }
        if cws >= window_ms && self.current.window_start == cws - window_ms {
            (
                Window {
                    window_start: cws,
                    count: 0,
                },
                Some(self.current),
            )
        } else {
            // more than one window elapsed since the last call: the old
            // window has fully rolled off, nothing to blend against.
            (
                Window {
                    window_start: cws,
                    count: 0,
                },
                None,
            )
        }
    }

    pub fn remaining(&self, params: &AlgorithmParams) -> u64 {
        params.capacity.saturating_sub(self.current.count)
    }

    pub fn reset_time_ms(&self, params: &AlgorithmParams) -> u64 {
        self.current.window_start + params.window_ms.max(1)
    }
}

fn window_start(now_ms: u64, window_ms: u64) -> u64 {
    let window_ms = window_ms.max(1);
    (now_ms / window_ms) * window_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(limit: u64, window_ms: u64) -> AlgorithmParams {
        AlgorithmParams {
            capacity: limit,
            refill_per_ms: 0.0,
            window_ms,
        }
    }

    #[test]
    fn blends_previous_window_by_elapsed_fraction() {
        let p = params(10, 1000);
        let mut s = SlidingWindowState::initial(&p, 0);
        for _ in 0..10 {
            let (next, ok) = s.try_consume(&p, 0);
            assert!(ok);
            s = next;
        }
        // fully into the next window at the boundary: previous window
        // (10 requests) should still weigh heavily at t=1000.
        let (_, ok) = s.try_consume(&p, 1000);
        assert!(!ok, "full previous window should still saturate the estimate right at the boundary");
    }

    #[test]
    fn independent_across_window_boundaries_far_apart() {
        let p = params(5, 1000);
        let s = SlidingWindowState::initial(&p, 0);
        let (s1, _) = s.try_consume(&p, 0);
        let (_, ok) = s1.try_consume(&p, 10_000);
        assert!(ok, "a window two periods later must not inherit old counts");
    }
}
