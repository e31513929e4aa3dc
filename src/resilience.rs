//! Retry and backoff utilities.
//!
//! Exponential backoff with jitter for the listener's reconnect loop and
//! the applier's transient-failure retries.

use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    /// Set to `usize::MAX` for infinite retries (listener reconnect).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Reconnect policy for the binlog listener.
    ///
    /// 1s initial, doubling, capped at 30s, retried until the run is
    /// stopped. The manager watches `last_healthy_at` to decide when the
    /// external fallback should take over.
    pub fn listener() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// Bounded retry for destination transactions.
    pub fn destination() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }

    /// Delay for an attempt with up to 25% additive jitter.
    ///
    /// Jitter spreads reconnect storms when several listeners lose the same
    /// source at once.
    pub fn jittered_delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter_cap = base.as_secs_f64() * 0.25;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_cap.max(f64::EPSILON));
        std::cmp::min(
            base + Duration::from_secs_f64(jitter),
            self.max_delay,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config() {
        let config = RetryConfig::listener();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_destination_config() {
        let config = RetryConfig::destination();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_delay_large_attempt_does_not_overflow() {
        let config = RetryConfig::listener();
        // powi overflows f64 into inf for huge exponents; the cap must hold.
        assert_eq!(config.delay_for_attempt(500), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        for _ in 0..50 {
            let d = config.jittered_delay_for_attempt(1);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(5)); // base + 25%
        }
    }

    #[test]
    fn test_jittered_delay_respects_cap() {
        let config = RetryConfig::listener();
        for _ in 0..50 {
            assert!(config.jittered_delay_for_attempt(30) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_testing_preset() {
        let config = RetryConfig::testing();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(10));
    }
}
