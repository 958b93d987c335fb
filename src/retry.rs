//! Retry policy and executor.

use std::time::Duration;

use crate::backoff::Backoff;
use crate::cancel::CancelToken;
use crate::error::{ConfigError, FailoverError, FailoverResult};
use crate::kind::{Classify, FailureKinds};

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    retryable_failures: FailureKinds,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            retryable_failures: FailureKinds::transient(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy retrying transient failures.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            max_retries,
            backoff: Backoff::new(base_delay, max_delay, exponential_base)?,
            retryable_failures: FailureKinds::transient(),
        })
    }

    /// A policy making exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Replaces the set of failure kinds worth retrying.
    pub fn with_retryable_failures(mut self, kinds: FailureKinds) -> Self {
        self.retryable_failures = kinds;
        self
    }

    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The delay schedule.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Failure kinds worth retrying.
    pub fn retryable_failures(&self) -> FailureKinds {
        self.retryable_failures
    }

    /// Returns true if `error` should be retried (attempts permitting).
    ///
    /// Rejections and cancellations never are.
    pub fn is_retryable<E: Classify>(&self, error: &FailoverError<E>) -> bool {
        error
            .failure_kind()
            .is_some_and(|kind| self.retryable_failures.contains(kind))
    }
}

/// What to do after a failed attempt.
enum Next<E> {
    Retry(Duration),
    GiveUp(FailoverError<E>),
}

/// Runs an operation until it succeeds, fails for good, or runs out of
/// attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates a new retry executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `f`, passing the 0-based attempt index.
    pub fn execute<T, E, F>(&self, token: &CancelToken, f: F) -> FailoverResult<T, E>
    where
        F: FnMut(u32) -> FailoverResult<T, E>,
        E: Classify + std::fmt::Display,
    {
        self.execute_observed(token, f, |_, _| {})
    }

    /// Like [`execute`](Self::execute), calling `observe` after every attempt
    /// with its index and outcome.
    pub fn execute_observed<T, E, F, O>(
        &self,
        token: &CancelToken,
        mut f: F,
        mut observe: O,
    ) -> FailoverResult<T, E>
    where
        F: FnMut(u32) -> FailoverResult<T, E>,
        O: FnMut(u32, &FailoverResult<T, E>),
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }

            let outcome = f(attempt);
            observe(attempt, &outcome);

            match self.after_attempt(attempt, outcome) {
                Ok(value) => return Ok(value),
                Err(Next::GiveUp(error)) => return Err(error),
                Err(Next::Retry(delay)) => {
                    if !token.sleep(delay) {
                        tracing::debug!(attempt, "retry cancelled during backoff");
                        return Err(FailoverError::Cancelled);
                    }
                }
            }
            attempt += 1;
        }
    }

    fn after_attempt<T, E>(&self, attempt: u32, outcome: FailoverResult<T, E>) -> Result<T, Next<E>>
    where
        E: Classify + std::fmt::Display,
    {
        let error = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !self.policy.is_retryable(&error) {
            tracing::debug!(attempt, %error, "failure is not retryable");
            return Err(Next::GiveUp(error));
        }
        if attempt >= self.policy.max_retries {
            tracing::warn!(attempts = attempt + 1, %error, "retries exhausted");
            return Err(Next::GiveUp(error));
        }

        let delay = self.policy.backoff.delay(attempt);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "attempt failed, retrying"
        );
        Err(Next::Retry(delay))
    }

    /// Async version of [`execute_observed`](Self::execute_observed).
    ///
    /// Dropping the returned future cancels the sequence at its current await
    /// point; `token` additionally interrupts the backoff sleep.
    #[cfg(feature = "async")]
    pub async fn execute_async_observed<T, E, F, Fut, O>(
        &self,
        token: &CancelToken,
        mut f: F,
        mut observe: O,
    ) -> FailoverResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = FailoverResult<T, E>>,
        O: FnMut(u32, &FailoverResult<T, E>),
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }

            let outcome = f(attempt).await;
            observe(attempt, &outcome);

            match self.after_attempt(attempt, outcome) {
                Ok(value) => return Ok(value),
                Err(Next::GiveUp(error)) => return Err(error),
                Err(Next::Retry(delay)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(FailoverError::Cancelled),
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Async version of [`execute`](Self::execute).
    #[cfg(feature = "async")]
    pub async fn execute_async<T, E, F, Fut>(&self, token: &CancelToken, f: F) -> FailoverResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = FailoverResult<T, E>>,
        E: Classify + std::fmt::Display,
    {
        self.execute_async_observed(token, f, |_, _| {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::FailureKind;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    struct TestError(FailureKind);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error ({})", self.0)
        }
    }

    impl Classify for TestError {
        fn failure_kind(&self) -> FailureKind {
            self.0
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
        )
        .unwrap()
    }

    fn fail(kind: FailureKind) -> FailoverResult<u32, TestError> {
        Err(FailoverError::Operation(TestError(kind)))
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy(3));
        let result = executor.execute(&CancelToken::new(), |attempt| {
            if attempt < 2 {
                fail(FailureKind::ServerError)
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn exhausts_and_returns_last_failure_with_growing_delays() {
        let executor = RetryExecutor::new(fast_policy(3));
        let mut started = Vec::new();
        let result = executor.execute(&CancelToken::new(), |attempt| {
            started.push(Instant::now());
            if attempt == 3 {
                fail(FailureKind::Timeout)
            } else {
                fail(FailureKind::Connection)
            }
        });

        assert_eq!(started.len(), 4);
        let gaps: Vec<_> = started.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps[1] >= Duration::from_millis(20));
        assert!(gaps[2] >= Duration::from_millis(40));
        assert_eq!(
            result.unwrap_err().operation(),
            Some(&TestError(FailureKind::Timeout))
        );
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let executor = RetryExecutor::new(fast_policy(0));
        let mut calls = 0;
        let result = executor.execute(&CancelToken::new(), |_| {
            calls += 1;
            fail(FailureKind::RateLimited)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn non_retryable_failure_propagates_immediately() {
        let executor = RetryExecutor::new(fast_policy(5));
        let mut calls = 0;
        let result = executor.execute(&CancelToken::new(), |_| {
            calls += 1;
            fail(FailureKind::InvalidRequest)
        });
        assert_eq!(calls, 1);
        assert_eq!(
            result.unwrap_err().operation(),
            Some(&TestError(FailureKind::InvalidRequest))
        );
    }

    #[test]
    fn circuit_open_is_never_retried() {
        let executor = RetryExecutor::new(fast_policy(5));
        let mut calls = 0;
        let result: FailoverResult<(), TestError> = executor.execute(&CancelToken::new(), |_| {
            calls += 1;
            Err(FailoverError::CircuitOpen {
                dependency: "x".into(),
            })
        });
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls, 1);
    }

    #[test]
    fn timeouts_are_retryable_by_default() {
        let executor = RetryExecutor::new(fast_policy(1));
        let mut calls = 0;
        let _: FailoverResult<(), TestError> = executor.execute(&CancelToken::new(), |_| {
            calls += 1;
            Err(FailoverError::Timeout(Duration::from_millis(1)))
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn cancellation_between_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30), 1.0)
            .unwrap();
        let executor = RetryExecutor::new(policy);
        let token = CancelToken::with_budget(Duration::from_millis(30));
        let mut calls = 0;

        let start = Instant::now();
        let result = executor.execute(&token, |_| {
            calls += 1;
            fail(FailureKind::Connection)
        });
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn observer_sees_every_attempt() {
        let executor = RetryExecutor::new(fast_policy(2));
        let mut seen = Vec::new();
        let _ = executor.execute_observed(
            &CancelToken::new(),
            |attempt| if attempt < 2 { fail(FailureKind::Timeout) } else { Ok(attempt) },
            |attempt, outcome| seen.push((attempt, outcome.is_ok())),
        );
        assert_eq!(seen, vec![(0, false), (1, false), (2, true)]);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_retry_succeeds() {
        let executor = RetryExecutor::new(fast_policy(3));
        let result = executor
            .execute_async(&CancelToken::new(), |attempt| async move {
                if attempt == 0 {
                    fail(FailureKind::ServerError)
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }
}
