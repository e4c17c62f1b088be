use std::time::Duration;

use crate::config::EngineConfig;

/// Step-level retry budget with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Whether a step that has now failed `retry_count` times gets another
    /// attempt.
    pub fn should_retry(&self, retry_count: i32) -> bool {
        retry_count >= 0 && (retry_count as u32) < self.max_retries
    }

    /// `base * 2^(retry_count - 1)`, capped at `max_delay`.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 31) as u32;
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn backoff_chrono(&self, retry_count: i32) -> chrono::Duration {
        chrono::Duration::from_std(self.backoff(retry_count)).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
