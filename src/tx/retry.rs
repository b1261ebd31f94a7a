//! Bounded retry with randomized exponential backoff
//!
//! Version conflicts are the normal failure mode of optimistic concurrency,
//! so callers wrap their transaction bodies in a [`RetryPolicy`] instead of
//! handling each conflict by hand. Only retryable errors are retried; the
//! final attempt's error is returned as-is.

use std::time::Duration;

use rand::Rng;

use crate::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_micros(200),
            max_delay: Duration::from_millis(20),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Run `body` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is exhausted.
    pub fn run<T, F>(&self, mut body: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            match body() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    std::thread::sleep(self.backoff(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Full-jitter backoff: uniform in `[0, min(base * 2^attempt, max)]`
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX));
        let cap = exp.min(self.max_delay);
        let micros = cap.as_micros() as u64;
        if micros == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=micros))
    }
}

// ============================================================================
// Tests
// ============================================================================
