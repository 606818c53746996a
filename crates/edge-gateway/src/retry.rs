//! Linear retry for store-bound gateway operations
//!
//! Attempt `n` (counting from 1) that fails with a transient error is
//! followed by a sleep of `n * step` before the next attempt. The attempt
//! index is handed to the operation so it can do first-attempt-only work.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry budget for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Backoff increment between attempts
    pub step: Duration,
}

impl RetryPolicy {
    /// Registration status patch: 4 attempts, 50/100/150 ms apart
    pub const REGISTRATION: Self = Self {
        attempts: 4,
        step: Duration::from_millis(50),
    };

    /// Heartbeat: the first attempt plus 4 retries, 50/100/150/200 ms apart
    pub const HEARTBEAT: Self = Self {
        attempts: 5,
        step: Duration::from_millis(50),
    };

    /// Configuration polls
    pub const ASSEMBLY: Self = Self {
        attempts: 3,
        step: Duration::from_millis(50),
    };

    /// Delay after the given zero-based attempt failed
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step * (attempt + 1)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out
///
/// Dropping the returned future cancels any pending sleep.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                debug!(attempt, ?delay, error = %e, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
