//! Reconnection Policy
//!
//! Exponential backoff for WebSocket reconnection: the Nth retry waits
//! `min(initial * multiplier^(N-1), max)`, and a successful connection
//! resets the sequence. Jitter is available as a knob but defaults to
//! zero so the retry schedule is deterministic.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (2.0 doubles the delay).
    pub multiplier: f64,
    /// Jitter factor as a fraction (0.1 = ±10% randomization; 0 disables).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Reconnection policy implementing exponential backoff.
///
/// # Example
///
/// ```rust
/// use exchange_stream_mux::infrastructure::exchanges::reconnect::{
///     ReconnectConfig, ReconnectPolicy,
/// };
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// // Delay for the first retry
/// let delay = policy.next_delay();
/// assert!(delay.is_some());
///
/// // After a successful connection
/// policy.reset();
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Next delay duration, applying exponential backoff and jitter.
    ///
    /// Returns `None` once max attempts are exceeded.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        // Advance the base delay for subsequent calls.
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        let capped_u64 = u64::try_from(capped).unwrap_or(u64::MAX);
        self.current_delay = Duration::from_millis(capped_u64);

        Some(delay_with_jitter)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn delays_double_until_capped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        };
        let mut policy = ReconnectPolicy::new(config);

        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(200));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(400));
        // 800 would exceed the cap.
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(500));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn successful_connection_resets_sequence() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        };
        let mut policy = ReconnectPolicy::new(config);

        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn max_attempts_is_enforced() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 3,
        };
        let mut policy = ReconnectPolicy::new(config);

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });

            let millis = policy.next_delay().unwrap().as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn unlimited_attempts_never_exhaust() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        for _ in 0..1000 {
            assert!(policy.should_retry());
            assert!(policy.next_delay().is_some());
        }
    }
}
