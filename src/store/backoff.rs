//! Exponential backoff used between failed store reads

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000, // 30 seconds
            multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Exponential backoff calculator with jitter.
///
/// Stateless: the caller tracks the attempt number, so one instance can be
/// shared behind `&self`.
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(63) as i32;
        let base_delay = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        // Apply jitter only if there is something to jitter
        let jitter_range = capped_delay * self.config.jitter_factor;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).clamp(1.0, self.config.max_delay_ms.max(1) as f64)
        } else {
            capped_delay.max(1.0)
        };

        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: u64, max: u64, multiplier: f64) -> ExponentialBackoff {
        ExponentialBackoff::with_config(BackoffConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier,
            jitter_factor: 0.0, // No jitter for predictable testing
        })
    }

    #[test]
    fn test_exponential_backoff_increases() {
        let backoff = no_jitter(100, 10_000, 2.0);

        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let backoff = no_jitter(1000, 5000, 10.0);

        assert_eq!(backoff.delay_for(5), Duration::from_millis(5000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::with_config(BackoffConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        });

        for _ in 0..50 {
            let delay = backoff.delay_for(1).as_millis();
            assert!((900..=1100).contains(&delay), "delay out of range: {}", delay);
        }
    }
}
