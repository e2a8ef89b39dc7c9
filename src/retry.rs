//! Exponential backoff for infrastructure calls.
//!
//! Used for the initial Redis/Postgres connections (fatal once exhausted)
//! and for the worker's status transitions (logged once exhausted).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How many times to try and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for connecting at startup: 5 attempts, 1s doubling.
    pub fn startup() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Policy for a single store write: 3 attempts, 1s/2s.
    pub fn store_write() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt number `attempt` (0-based, so attempt 1 is the first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds or the policy is exhausted, returning the last error.
pub async fn with_backoff<T, E, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts => {
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %err,
                    "Transient failure, will retry"
                );
            }
            Err(err) => return Err(err),
        }
        attempt += 1;
    }
}

/// Delay the worker loop waits after a queue error, doubling up to `max`.
pub fn loop_backoff(consecutive_errors: u32, base: Duration, max: Duration) -> Duration {
    RetryPolicy {
        attempts: u32::MAX,
        base_delay: base,
        max_delay: max,
    }
    .delay_for(consecutive_errors.max(1))
}
