use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::request::{FailureLogger, Requester};

/// Raised when cancellation fires while a retry back-off sleep is pending.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("retry interrupted by cancellation")]
pub struct RetryInterrupted;

/// Decides whether a failed attempt is worth repeating.
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Computes the back-off before the next attempt from the attempt number
/// (1-based) and the error it produced.
pub type RetryDelay = Arc<dyn Fn(u32, &anyhow::Error) -> Duration + Send + Sync>;

/// Controls how [`Retry`] repeats failed requests.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 2 disable
    /// retrying.
    pub max_attempts: u32,
    /// Flat back-off between attempts when `delay_for` is unset.
    pub delay: Duration,
    /// Optional veto on retrying a particular error.
    pub should_retry: Option<RetryPredicate>,
    /// Optional per-attempt back-off override.
    pub delay_for: Option<RetryDelay>,
}

/// Requester decorator that repeats failed attempts per a [`RetryPolicy`].
pub struct Retry<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R> Retry<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<R: Requester> Requester for Retry<R> {
    async fn call(&self, cancel: CancellationToken) -> Result<()> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.inner.call(cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if attempt >= attempts {
                return Err(err);
            }
            if let Some(should_retry) = &self.policy.should_retry {
                if !should_retry(&err) {
                    return Err(err);
                }
            }

            let backoff = match &self.policy.delay_for {
                Some(delay_for) => delay_for(attempt, &err),
                None => self.policy.delay,
            };

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(RetryInterrupted.into()),
            }

            attempt += 1;
        }
    }
}

/// Requester decorator that reports failures to a [`FailureLogger`].
pub struct LogFailures<R> {
    inner: R,
    logger: Option<Arc<dyn FailureLogger>>,
}

impl<R> LogFailures<R> {
    pub fn new(inner: R, logger: Option<Arc<dyn FailureLogger>>) -> Self {
        Self { inner, logger }
    }
}

#[async_trait]
impl<R: Requester> Requester for LogFailures<R> {
    async fn call(&self, cancel: CancellationToken) -> Result<()> {
        let result = self.inner.call(cancel).await;

        if let (Err(err), Some(logger)) = (&result, &self.logger) {
            logger.log_failure(err);
        }

        result
    }
}
