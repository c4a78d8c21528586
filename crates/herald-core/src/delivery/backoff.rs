//! Exponential backoff for delivery retries.

use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt - 1)`, jittered, capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay for the first retry
    pub base: Duration,

    /// Upper bound on any single delay
    pub cap: Duration,

    /// Jitter factor (0.0 - 1.0) applied symmetrically
    pub jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt (1-indexed: attempt 1 is the
    /// first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let unjittered = self
            .base
            .as_secs_f64()
            .mul_add(2f64.powi(exponent.min(32) as i32), 0.0)
            .min(self.cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            use rand::Rng;
            let spread = unjittered * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (unjittered + offset).max(0.0)
        } else {
            unjittered
        };

        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64()))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(300)).with_jitter(0.0)
    }

    #[test]
    fn test_doubling() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn test_delays_strictly_increase_until_cap() {
        let backoff = no_jitter();
        let mut previous = Duration::from_secs(0);
        for attempt in 1..=7 {
            let delay = backoff.delay_for(attempt);
            assert!(delay > previous, "attempt {} did not increase", attempt);
            previous = delay;
        }
    }

    #[test]
    fn test_cap() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay_for(30), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(300)).with_jitter(0.5);
        for _ in 0..100 {
            let delay = backoff.delay_for(1).as_secs_f64();
            assert!((5.0..=15.0).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(300));
    }
}
