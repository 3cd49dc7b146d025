//! Redispatch delay after a failed attempt.

use std::time::Duration;

use crate::config::Config;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Spread each delay by up to ±25%.
    pub jitter: bool,
}

impl Backoff {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.backoff_jitter,
        }
    }

    /// Delay before the task may run again, given the number of failed
    /// attempts so far (1 after the first failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base_ms = self.base.as_millis() as f64;
        let delay_ms = (base_ms * 2f64.powi(exponent)).min(self.max.as_millis() as f64);

        let delay_ms = if self.jitter {
            let jitter = (rand::random::<f64>() - 0.5) * 0.5 * delay_ms;
            (delay_ms + jitter).max(0.0)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// `now + delay_for_attempt(attempt)` as a chrono timestamp.
    pub fn retry_at(
        &self,
        attempt: u32,
        now: chrono::DateTime<chrono::Utc>,
    ) -> chrono::DateTime<chrono::Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max.as_millis() as i64));
        now + delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(base_ms: u64, max_ms: u64) -> Backoff {
        Backoff {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter: false,
        }
    }

    #[test]
    fn test_doubles_then_caps() {
        let backoff = fixed(100, 1_000);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for_attempt(500), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let backoff = Backoff {
            jitter: true,
            ..fixed(1_000, 60_000)
        };
        for _ in 0..100 {
            let delay = backoff.delay_for_attempt(1).as_millis();
            assert!((750..=1_250).contains(&delay), "delay {delay}ms out of range");
        }
    }

    #[test]
    fn test_retry_at_is_in_the_future() {
        let backoff = fixed(500, 500);
        let now = chrono::Utc::now();
        assert_eq!(backoff.retry_at(1, now), now + chrono::Duration::milliseconds(500));
    }
}
