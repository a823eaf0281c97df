//! Bounded retry with exponential backoff and jitter
//!
//! Each attempt runs under its own timeout; the timeout never accumulates
//! across retries. Backoff between attempt `n` and `n + 1` is
//! `base * 2^n + jitter`, with the jitter drawn uniformly so concurrently
//! failing routes do not retry in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Backoff and timeout wrapper around an asynchronous call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_backoff: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy with explicit backoff parameters
    pub fn new(base_backoff: Duration, max_jitter: Duration) -> Self {
        Self {
            base_backoff,
            max_jitter,
        }
    }

    /// Create a policy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_jitter_ms),
        )
    }

    /// Run `op`, retrying up to `max_retries` additional times on failure.
    ///
    /// An attempt that does not settle within `timeout` fails with
    /// [`Error::Timeout`] and is retried like any other failure. If the
    /// final attempt fails, its error is propagated verbatim.
    pub async fn execute<F, Fut, T>(
        &self,
        op: F,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            let result = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_retries && err.is_retryable() => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delay before the retry that follows attempt `attempt` (zero-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt));
        let jitter_bound = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_bound)
        };
        Duration::from_millis(exponential + jitter)
    }
}
