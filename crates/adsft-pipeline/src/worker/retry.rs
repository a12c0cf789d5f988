//! Connection retry policy

use std::time::Duration;

/// Bounded exponential backoff for broker connection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total connection attempts before giving up
    pub max_attempts: u32,
    /// Wait after the first failed attempt, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound for any single wait, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff_ms(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Wait before retrying after failed attempt number `attempt` (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(base_ms.min(self.max_backoff_ms))
    }
}
