//! Retry policy
//!
//! A plain value, not a strategy object: exponential backoff with a clamp,
//! ±10% jitter and a 100ms floor. The writer applies it to every flush and
//! the replay loop reuses the same parameters.

use std::time::Duration;

use rand::Rng;

use fl_config::TimescaleSettings;

/// Backoff never goes below this, jitter included.
const MIN_DELAY_MS: u64 = 100;
/// Jitter band around the computed delay.
const JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &TimescaleSettings) -> Self {
        Self {
            max_attempts: settings.max_retry_attempts,
            base_delay: Duration::from_millis(settings.retry_delay_ms),
            max_delay: Duration::from_millis(settings.max_retry_delay_ms),
        }
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// clamped to `max_delay`, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let raw_ms = self.base_delay.as_millis() as f64 * 2f64.powi(exponent as i32);
        let clamped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let jitter = rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        let jittered_ms = (clamped_ms * jitter).max(MIN_DELAY_MS as f64);
        Duration::from_millis(jittered_ms as u64)
    }
}
