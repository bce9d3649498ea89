//! Async retry loop driven by a [`RetryPolicy`].

use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::debug;

use partchain_core::{ErrorCause, ProcessStep, ProcessingError, ToErrorCause};

use crate::types::RetryPolicy;

/// The last error of a step that failed on every permitted attempt.
#[derive(Debug, Clone)]
pub struct RetryExhausted<E> {
    pub error: E,
    /// Attempts made, the first one included.
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

impl<E: ToErrorCause> RetryExhausted<E> {
    pub fn cause(&self) -> ErrorCause {
        self.error.to_error_cause()
    }

    pub fn into_processing_error(self, step: ProcessStep) -> ProcessingError {
        let mut error = ProcessingError::from_cause(&self.error.to_error_cause())
            .with_process_step(step)
            .with_retry_counter_and_last_attempt_now(self.attempts);
        error.last_attempt = self.last_attempt;
        error
    }
}

impl<E: ToErrorCause> ToErrorCause for RetryExhausted<E> {
    fn to_error_cause(&self) -> ErrorCause {
        self.cause()
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `retryable`
/// rejects an error.
///
/// `op` receives the 1-based attempt number. Between attempts the task
/// sleeps for [`RetryPolicy::delay_for_attempt`].
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    step: ProcessStep,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !retryable(&error) || !policy.should_retry(attempt) {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                        last_attempt: Utc::now(),
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(step = ?step, attempt, delay_ms = delay.as_millis() as u64, "retrying step");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
