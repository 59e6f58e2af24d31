//! Exponential backoff with jitter for the rule sync loop.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Configuration for backoff behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
    /// Whether to randomize delays between 0.5x and 1.5x.
    pub use_jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Creates a new backoff configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }
}

/// Tracks consecutive failures and hands out the next delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay for the current failure count, without recording anything.
    pub fn current_delay(&self) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exponent = self.failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.config.multiplier.powi(exponent);
        let max_ms = self.config.max_delay.as_millis() as f64;
        let delay_ms = delay_ms.min(max_ms);

        let delay_ms = if self.config.use_jitter {
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            (delay_ms * jitter).min(max_ms)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.current_delay();
        debug!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        delay
    }

    /// Clears the failure count after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_config_builder() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter(false);

        assert_eq!(config.base_delay, Duration::from_millis(200));
        assert_eq!(config.max_delay, Duration::from_secs(2));
        assert!(!config.use_jitter);
    }

    #[test]
    fn test_delay_increases() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_jitter(false);
        let mut backoff = Backoff::new(config);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn test_delay_capped() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_multiplier(10.0);
        let mut backoff = Backoff::new(config);

        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_reset() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);
        let mut backoff = Backoff::new(config);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
