//! First-success selection over concurrently running attempts.

use std::fmt;
use std::future::Future;

use tokio::task::JoinSet;
use tracing::debug;

use partchain_core::{ErrorCause, ToErrorCause};

/// Why one attempt did not produce a value.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Failed(E),
    /// The attempt's task panicked or was aborted.
    Aborted(String),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Failed(e) => e.fmt(f),
            AttemptFailure::Aborted(reason) => write!(f, "attempt aborted: {reason}"),
        }
    }
}

impl<E: ToErrorCause> ToErrorCause for AttemptFailure<E> {
    fn to_error_cause(&self) -> ErrorCause {
        match self {
            AttemptFailure::Failed(e) => e.to_error_cause(),
            AttemptFailure::Aborted(reason) => ErrorCause::new("Aborted", reason.clone()),
        }
    }
}

/// Every attempt failed. Failures are kept in completion order.
#[derive(Debug, thiserror::Error)]
#[error("all {} attempts failed", .failures.len())]
pub struct AllAttemptsFailed<E: fmt::Debug> {
    pub failures: Vec<AttemptFailure<E>>,
}

impl<E: fmt::Debug> AllAttemptsFailed<E> {
    pub fn failed(&self) -> impl Iterator<Item = &E> {
        self.failures.iter().filter_map(|f| match f {
            AttemptFailure::Failed(e) => Some(e),
            AttemptFailure::Aborted(_) => None,
        })
    }
}

impl<E: fmt::Debug + ToErrorCause> ToErrorCause for AllAttemptsFailed<E> {
    fn to_error_cause(&self) -> ErrorCause {
        ErrorCause::new("AllAttemptsFailed", self.to_string())
            .with_suppressed(self.failures.iter().map(|f| f.to_error_cause()).collect())
    }
}

/// Races independent attempts and keeps the first success.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFinder;

impl ResultFinder {
    /// Run every future as its own task and return the first successful value.
    ///
    /// `None` or an empty list yields `Ok(None)`. When every attempt fails,
    /// the error aggregates all failures. Attempts still running when a
    /// success arrives are aborted.
    pub async fn get_fastest_result<T, E, F>(
        &self,
        futures: Option<Vec<F>>,
    ) -> Result<Option<T>, AllAttemptsFailed<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Debug + Send + 'static,
    {
        let futures = match futures {
            Some(futures) if !futures.is_empty() => futures,
            _ => return Ok(None),
        };

        let mut attempts = JoinSet::new();
        for future in futures {
            attempts.spawn(future);
        }

        let mut failures = Vec::new();
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(value)) => {
                    debug!(failed_before = failures.len(), "attempt succeeded");
                    return Ok(Some(value));
                }
                Ok(Err(e)) => failures.push(AttemptFailure::Failed(e)),
                Err(e) => failures.push(AttemptFailure::Aborted(e.to_string())),
            }
        }

        Err(AllAttemptsFailed { failures })
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Remote(&'static str);

    impl ToErrorCause for Remote {
        fn to_error_cause(&self) -> ErrorCause {
            ErrorCause::new("Remote", self.0)
        }
    }

    type Attempt = Pin<Box<dyn Future<Output = Result<&'static str, Remote>> + Send>>;

    fn after(ms: u64, outcome: Result<&'static str, Remote>) -> Attempt {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            outcome
        })
    }

    #[tokio::test]
    async fn missing_or_empty_input_yields_nothing() {
        let finder = ResultFinder;
        assert!(finder.get_fastest_result::<_, Remote, Attempt>(None).await.unwrap().is_none());
        assert!(finder.get_fastest_result::<_, Remote, Attempt>(Some(vec![])).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins_even_after_failures() {
        let finder = ResultFinder;
        let result = finder
            .get_fastest_result(Some(vec![
                after(10, Err(Remote("a down"))),
                after(30, Ok("slow")),
                after(20, Ok("fast")),
            ]))
            .await
            .unwrap();
        assert_eq!(result, Some("fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_are_aggregated_in_completion_order() {
        let finder = ResultFinder;
        let err = finder
            .get_fastest_result(Some(vec![
                after(20, Err(Remote("second"))),
                after(10, Err(Remote("first"))),
            ]))
            .await
            .unwrap_err();

        let messages: Vec<_> = err.failed().cloned().collect();
        assert_eq!(messages, vec![Remote("first"), Remote("second")]);

        let cause = err.to_error_cause();
        assert_eq!(cause.suppressed.len(), 2);
        assert_eq!(
            partchain_core::root_error_messages(&cause.suppressed),
            vec!["Remote: first", "Remote: second"]
        );
    }

    #[tokio::test]
    async fn panicking_attempt_counts_as_failure() {
        let finder = ResultFinder;
        let panicking: Attempt = Box::pin(async {
            let client: Option<&'static str> = None;
            Ok::<_, Remote>(client.expect("registry client bug"))
        });
        let err = finder
            .get_fastest_result(Some(vec![panicking]))
            .await
            .unwrap_err();
        assert!(matches!(err.failures[0], AttemptFailure::Aborted(_)));
    }
}
