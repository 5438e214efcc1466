//! Classification-driven retry with exponential backoff.
//!
//! [`RetryPolicy::run`] wraps one remote call. Retryable failures (see
//! [`ApiError::is_retryable`]) are repeated up to `max_attempts` times in
//! total; everything else is returned immediately.
//!
//! | Attempt | Delay before next attempt |
//! |---------|---------------------------|
//! | 1 | `base_delay` |
//! | 2 | `base_delay * 2` |
//! | n | `min(base_delay * 2^(n-1), max_delay)` |
//!
//! A 429 response carrying `Retry-After` waits exactly the server's hint.
//!
//! The attempt number is passed to the operation so creation calls can look
//! for an entity a previous, timed-out attempt may already have created.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::{ApiError, ApiResult};

/// Retry settings shared by every remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Minimum 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, err: &ApiError, attempt: u32) -> Duration {
        if let ApiError::RateLimited {
            retry_after: Some(hint),
        } = err
        {
            return *hint;
        }

        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> ApiResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(&err, attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation, attempt, max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
