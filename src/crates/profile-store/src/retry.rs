//! Retry policy for store calls
//!
//! Bounded exponential backoff with optional jitter. The store gateway uses
//! [`RetryConfig::backoff_delay`] between attempts on transient failures and
//! gives up after [`RetryConfig::max_retries`] retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a store call that failed transiently is repeated.
///
/// Delays start at `initial_backoff_ms`, grow by `backoff_multiplier` per
/// retry and stop growing at `max_backoff_ms`. Permanent failures are never
/// retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first store call; 0 means a single call
    pub max_retries: u32,

    /// Pause before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Ceiling for the grown pause, in milliseconds
    pub max_backoff_ms: u64,

    pub backoff_multiplier: f64,

    /// Add a random 0-25% on top of each pause
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default curve with a different retry budget
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Tests turn jitter off for exact timings
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of calls allowed, including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pause before retry number `attempt + 1`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms =
            (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64;

        let delay_ms = delay_ms.min(self.max_backoff_ms);

        let delay_ms = if self.jitter {
            // Up to 25% on top, still bounded
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms
                .saturating_add(jitter_amount)
                .min(self.max_backoff_ms.saturating_add(self.max_backoff_ms / 4))
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.initial_backoff_ms, 500);
        assert_eq!(config.max_backoff_ms, 8_000);
        assert!(config.jitter);
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let config = RetryConfig::new(3)
            .with_initial_backoff(1000)
            .with_max_backoff(60_000)
            .with_jitter(false);

        assert_eq!(config.backoff_delay(0).as_millis(), 1000);
        assert_eq!(config.backoff_delay(1).as_millis(), 2000);
        assert_eq!(config.backoff_delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_backoff_delay_max_cap() {
        let config = RetryConfig::new(10)
            .with_initial_backoff(1000)
            .with_max_backoff(5000)
            .with_jitter(false);

        // Would be 32000 without cap
        assert_eq!(config.backoff_delay(5).as_millis(), 5000);
        assert_eq!(config.backoff_delay(u32::MAX).as_millis(), 5000);
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let config = RetryConfig::new(3)
            .with_initial_backoff(1000)
            .with_max_backoff(4000);

        for attempt in 0..8 {
            let delay = config.backoff_delay(attempt).as_millis();
            assert!(delay >= 1000);
            assert!(delay <= 5000);
        }
    }
}
