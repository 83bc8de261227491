//! Bounded retry with a fixed delay between attempts.

use std::time::Duration;

use crate::StoreError;

/// How often and how patiently to retry a filesystem operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Number of attempts that will actually be made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        if self.max_retries == 0 {
            1
        } else {
            self.max_retries
        }
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`StoreError::RetriesExhausted`] wrapping the last failure.
pub async fn retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut(u32) -> Result<T, StoreError>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                log::error!("{what} failed on final attempt {attempt}/{attempts}: {e}");
                return Err(StoreError::RetriesExhausted {
                    what: what.to_string(),
                    attempts,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                log::warn!(
                    "{what} failed (attempt {attempt}/{attempts}), retrying in {:?}: {e}",
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
