//! Reconnect retry policy.

use std::time::Duration;

use warren_connection::RecoveryConfig;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Connect attempts before giving up. Each attempt walks the whole endpoint list.
    pub max_attempts: u32,

    /// Wait before the first attempt.
    pub initial_backoff: Duration,

    /// Upper bound for any single wait.
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for RetryPolicy {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.interval,
            max_backoff: config.max_interval.max(config.interval),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt number `attempt` (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        if !multiplier.is_finite() {
            return self.max_backoff;
        }
        Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * multiplier)
            .map_or(self.max_backoff, |backoff| backoff.min(self.max_backoff))
    }
}
