//! Backoff policy for transient cluster failures.

use std::time::Duration;

/// Exponential backoff: `base_delay` doubled per attempt, capped at
/// `max_delay`, at most `max_attempts` tries per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as u64))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn retries_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
