//! Bounded retry for single administrative calls.
//!
//! Wraps one engine call in a fixed number of attempts with a fixed sleep
//! between them. Only errors on the transient whitelist are retried; lost
//! connections propagate immediately so the caller can fail over to another
//! agent instead of burning the retry budget against a dead one.

use crate::config::RetrySettings;
use crate::error::Result;
use std::future::Future;
use tokio::time::sleep;
use tracing::debug;

/// Retry helper configured from [`RetrySettings`].
#[derive(Debug, Clone)]
pub struct RetryHelper {
    settings: RetrySettings,
}

impl RetryHelper {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    /// Execute `f`, retrying transient failures up to the attempt budget.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.settings.max_attempts => {
                    debug!(
                        call = what,
                        attempt,
                        max_attempts = self.settings.max_attempts,
                        error = %e,
                        "Retrying transient engine error"
                    );
                    sleep(self.settings.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
