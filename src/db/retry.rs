//! Bounded retry with linear backoff for busy/locked stores.

use std::time::{Duration, Instant};

use crate::config::RetryConfig;
use crate::error::{StoreError, StoreResult};

/// How long to keep retrying a contended operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock ceiling across all attempts.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// A policy that never sleeps. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            timeout: Duration::from_secs(60),
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based): base × attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.base_delay * attempt).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-busy error, or the budget runs out.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_busy() => {
                    if attempt >= self.max_attempts || started.elapsed() >= self.timeout {
                        tracing::warn!(op = what, attempts = attempt, "giving up on locked store");
                        return Err(StoreError::Locked(format!(
                            "{what}: still locked after {attempt} attempts"
                        )));
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(op = what, attempt, delay_ms = delay.as_millis() as u64, "store busy, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
