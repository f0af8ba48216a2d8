//! Retry logic with capped exponential backoff.
//!
//! Retries are scoped to one HTTP operation. A [`Retrier`] tracks the attempts
//! of a single probe, range fetch or download request; it is never shared
//! between operations, so a failure further down the pipeline cannot cause an
//! earlier, successful request to be repeated.
//!
//! # Example
//!
//! ```no_run
//! use partfetch::retry::Retrier;
//! use partfetch::{Error, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Error> {
//! let policy = RetryPolicy::default();
//! let cancel = CancellationToken::new();
//! let body = Retrier::run(&policy, &cancel, "fetch", || async {
//!     Ok::<_, Error>(b"payload".to_vec())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::{Error, IsRetryable, Result};

/// Attempt bookkeeping for one guarded operation
pub struct Retrier<'a> {
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    operation: &'static str,
    attempt: u32,
}

impl<'a> Retrier<'a> {
    pub fn new(
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
        operation: &'static str,
    ) -> Self {
        Self {
            policy,
            cancel,
            operation,
            attempt: 0,
        }
    }

    /// Number of failed attempts so far
    pub fn failures(&self) -> u32 {
        self.attempt
    }

    /// Run `fut` unless the cancellation token fires first.
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    /// Handle a failed attempt.
    ///
    /// Returns `Ok(())` after sleeping when the caller should try again, or the
    /// error to surface when the failure is permanent, the attempts are used
    /// up, or the operation was cancelled during the backoff.
    pub async fn on_error(&mut self, err: Error) -> Result<()> {
        if !err.is_retryable() {
            return Err(err);
        }

        self.attempt += 1;
        let max_attempts = self.policy.max_attempts.max(1);
        if self.attempt >= max_attempts {
            tracing::error!(
                error = %err,
                operation = self.operation,
                attempts = self.attempt,
                "Operation failed after all retry attempts exhausted"
            );
            return Err(Error::RetriesExhausted {
                operation: self.operation,
                attempts: self.attempt,
                last: Box::new(err),
            });
        }

        let delay = self.policy.delay_for(self.attempt - 1);
        tracing::warn!(
            error = %err,
            operation = self.operation,
            attempt = self.attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Record a successful attempt.
    pub fn succeeded(&self) {
        if self.attempt > 0 {
            tracing::info!(
                operation = self.operation,
                attempts = self.attempt + 1,
                "Operation succeeded after retry"
            );
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the policy
    /// gives up. Each call of `operation` must be an independent attempt.
    pub async fn run<T, F, Fut>(
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        name: &'static str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retrier = Retrier::new(policy, cancel, name);
        loop {
            match retrier.guard(operation()).await {
                Ok(value) => {
                    retrier.succeeded();
                    return Ok(value);
                }
                Err(e) => retrier.on_error(e).await?,
            }
        }
    }
}
