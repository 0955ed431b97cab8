//! Bounded retry with exponential backoff around a single request.
//!
//! The delay before retrying failed attempt `i` (0-indexed) is
//! `base_delay * 2^i`. Only transient failures are retried; everything else,
//! and the final failure once attempts run out, is returned unchanged.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

/// Which failures count as transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// HTTP 429 and "too many outstanding requests".
    TooManyRequests,
    /// Also retries server errors (HTTP >= 500).
    Historical,
}

impl RetryPolicy {
    pub fn is_transient(self, err: &Error) -> bool {
        match err {
            Error::TooManyOutstanding(_) => true,
            Error::Status { status: 429, .. } => true,
            Error::Status { status, .. } => self == RetryPolicy::Historical && *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub policy: RetryPolicy,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration, policy: RetryPolicy) -> Self {
        Backoff {
            max_attempts,
            base_delay,
            policy,
        }
    }

    /// Delay before retrying after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `request` until it succeeds, fails permanently, or attempts run out.
    pub async fn execute<T, F, Fut>(&self, mut request: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < attempts && self.policy.is_transient(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backoff: transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
