//! Bounded polling with a fixed interval
//!
//! Both the transport connect loop and the trust bundle convergence loop run
//! through [`poll_bounded`]: an immediate first attempt, then one attempt per
//! `interval` until `timeout` has elapsed. A caller-supplied predicate can end
//! the loop early on errors that waiting will not fix, and a
//! [`CancellationToken`] is observed between iterations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Error;

/// Default interval between attempts (one minute)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default overall bound for a polling loop (ten minutes)
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval/timeout pair for a bounded polling loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between attempts
    pub interval: Duration,
    /// Overall bound, measured from the first attempt
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollConfig {
    /// Create a config with the given interval and timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Why a bounded poll ended without a value
#[derive(Debug)]
pub enum PollError {
    /// The timeout elapsed; carries the last error seen, if any
    TimedOut {
        /// Time spent polling
        elapsed: Duration,
        /// Most recent error returned by the attempt, if the last attempts errored
        last_error: Option<Error>,
    },
    /// Cancellation was observed between iterations
    Cancelled,
    /// The give-up predicate matched this error
    Aborted(Error),
}

/// Poll `attempt` until it yields a value, the give-up predicate matches, the
/// timeout elapses, or `cancel` fires.
///
/// `attempt` returns `Ok(Some(v))` when done, `Ok(None)` to keep waiting, and
/// `Err(e)` for a failed attempt. Failed attempts are retried unless
/// `give_up(&e)` is true.
pub async fn poll_bounded<T, F, Fut, G>(
    config: &PollConfig,
    cancel: &CancellationToken,
    description: &str,
    give_up: G,
    mut attempt: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
    G: Fn(&Error) -> bool,
{
    let start = Instant::now();
    let mut last_error: Option<Error> = None;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        attempts += 1;
        match attempt().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(operation = %description, attempts, "condition not met yet");
                last_error = None;
            }
            Err(e) if give_up(&e) => return Err(PollError::Aborted(e)),
            Err(e) => {
                debug!(operation = %description, attempts, error = %e, "attempt failed, will retry");
                last_error = Some(e);
            }
        }

        let elapsed = start.elapsed();
        if elapsed + config.interval > config.timeout {
            return Err(PollError::TimedOut {
                elapsed,
                last_error,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}
