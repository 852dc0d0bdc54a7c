//! DDZONE's optional per-worker read throttle: an integer microsecond
//! sleep budget that grows by 1000 µs whenever a buffer read exceeds the
//! configured cap and shrinks by 1000 µs (floored at zero) whenever it
//! doesn't.

use std::time::Duration;

/// Accumulates a sleep budget in response to observed per-buffer
/// throughput against a configured cap.
pub struct Throttle {
    cap_mb_s: u64,
    budget_micros: u64,
}

const STEP_MICROS: u64 = 1000;

impl Throttle {
    /// Builds a throttle capping each worker at `cap_mb_s` MB/s.
    #[must_use]
    pub fn new(cap_mb_s: u64) -> Self {
        Self {
            cap_mb_s,
            budget_micros: 0,
        }
    }

    /// Records one buffer's read of `bytes` over `elapsed`, adjusting the
    /// sleep budget, then returns the duration to sleep before the next
    /// read (zero if the budget is empty).
    pub fn observe(&mut self, bytes: u64, elapsed: Duration) -> Duration {
        let secs = elapsed.as_secs_f64();
        let instantaneous_mb_s = if secs > 0.0 {
            (bytes as f64 / 1_000_000.0) / secs
        } else {
            f64::INFINITY
        };

        if instantaneous_mb_s > self.cap_mb_s as f64 {
            self.budget_micros += STEP_MICROS;
        } else {
            self.budget_micros = self.budget_micros.saturating_sub(STEP_MICROS);
        }

        Duration::from_micros(self.budget_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overshoot_grows_budget() {
        let mut throttle = Throttle::new(1);
        let sleep = throttle.observe(8 * 1024 * 1024, Duration::from_millis(1));
        assert_eq!(sleep, Duration::from_micros(1000));
    }

    #[test]
    fn undershoot_shrinks_budget_floored_at_zero() {
        let mut throttle = Throttle::new(1_000_000);
        let sleep = throttle.observe(8 * 1024 * 1024, Duration::from_secs(1));
        assert_eq!(sleep, Duration::ZERO);
    }

    #[test]
    fn budget_accumulates_across_overshoots() {
        let mut throttle = Throttle::new(1);
        throttle.observe(8 * 1024 * 1024, Duration::from_millis(1));
        let sleep = throttle.observe(8 * 1024 * 1024, Duration::from_millis(1));
        assert_eq!(sleep, Duration::from_micros(2000));
    }
}
