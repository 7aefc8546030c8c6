//! Bounded retry schedule for backend calls.
//!
//! A policy is a finite list of waits (default 5 s then 30 s). A retryable
//! failure waits for the next entry and tries again; once the list is used up
//! one last attempt runs and its error propagates. Cancellation is checked
//! before every attempt and races every wait, so it always surfaces at once.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_RETRY_SCHEDULE;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_SCHEDULE.to_vec())
    }
}

impl RetryPolicy {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    pub fn max_attempts(&self) -> usize {
        self.schedule.len() + 1
    }

    /// Run `op` under this policy.
    ///
    /// Only [`Error::is_retryable`] failures are retried. Application, decode
    /// and configuration errors return on the first occurrence.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for (attempt, delay) in self.schedule.iter().enumerate() {
            match attempt_once(cancel, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts(),
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Backend call failed, backing off"
                    );
                    sleep(cancel, *delay).await?;
                }
            }
        }
        attempt_once(cancel, &mut op).await
    }
}

async fn attempt_once<T, F, Fut>(cancel: &CancellationToken, op: &mut F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = op() => result,
    }
}

/// Sleep that ends early with [`Error::Cancelled`] when the token fires.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
