//! Bounded retry of store calls that fail transiently.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::{Result, SessionError};

/// Outcome of [`retry_transient`].
#[derive(Debug)]
pub enum Retried<T> {
    /// The call succeeded, or failed with a non-transient error.
    Done(Result<T>),
    /// The token fired before the call could complete.
    Cancelled,
}

/// Runs `op` until it succeeds, fails non-transiently, or `policy` is
/// exhausted. Waits `policy.delay_for(n)` after the `n`-th failure.
///
/// Both the call and the backoff sleep race against `cancel`.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0;
    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Retried::Cancelled,
            result = op() => result,
        };

        let err = match result {
            Ok(value) => return Retried::Done(Ok(value)),
            Err(err) => err,
        };

        failures += 1;
        if !err.is_transient() || failures >= policy.max_attempts {
            return Retried::Done(Err(err));
        }

        let delay = policy.delay_for(failures);
        debug!(what, failures, delay = ?delay, error = %err, "Retrying after transient failure");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Retried::Cancelled,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

impl<T> Retried<T> {
    /// Collapses cancellation into `SessionError::ControllerClosed`.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Done(result) => result,
            Self::Cancelled => Err(SessionError::ControllerClosed),
        }
    }
}
