//! Backoff for cluster API writes
//!
//! Remote-host loops use [`crate::poll`] with a fixed interval. Writes against
//! the cluster object store (annotation patches, the converged bundle
//! ConfigMap) retry quickly instead, with jittered exponential backoff, and
//! stop at the first error [`Error::is_retryable`] rejects.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::Error;

/// Backoff schedule for a cluster API write
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Attempts including the first; at least one is always made
    pub max_attempts: u32,
    /// Base delay after the first failure
    pub initial_delay: Duration,
    /// Cap on the base delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Base delay after failed attempt number `attempt` (1-based), doubling
    /// each time up to `max_delay`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempts run out. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt >= config.max_attempts {
            return Err(err);
        }

        // jitter in [0.5, 1.5) keeps concurrent writers from retrying in lockstep
        let delay = config
            .base_delay(attempt)
            .mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "cluster write failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
