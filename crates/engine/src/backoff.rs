//! Exponential back-off for the transient backend race.

use std::time::Duration;

use lt_domain::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap applied after the multiplier.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Retries allowed before the error surfaces.
    pub max_attempts: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryBackoff {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            initial_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
            backoff_factor: cfg.backoff_factor,
            max_attempts: cfg.max_attempts,
        }
    }
}

impl RetryBackoff {
    /// Delay for the given retry number (0-indexed). No jitter: a single
    /// session retries alone, and tests rely on exact timing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether `attempt` retries have already been spent.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
