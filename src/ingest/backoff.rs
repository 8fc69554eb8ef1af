use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_millis(2000);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Decides how often and how long to wait before restarting a failed stream.
pub trait BackoffPolicy: Send + Sync {
    /// Retries allowed after the first attempt.
    fn max_retries(&self) -> u32;

    /// Wait before retry number `retry` (0 for the first retry).
    fn delay(&self, retry: u32) -> Duration;
}

/// `base * 2^retry`: 2s, 4s, 8s with the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_retries: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX_RETRIES)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn delay(&self, retry: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(retry))
    }
}
