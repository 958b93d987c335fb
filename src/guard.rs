//! Explicit layering of timeout, breaker and retry around an operation.
//!
//! Each layer is a value implementing [`Invocation`] that owns the layer
//! inside it, so the order of layers is visible in the type and in the code
//! building it:
//!
//! ```rust
//! use std::time::Duration;
//! use provider_failover::{
//!     CancelToken, CircuitBreaker, CircuitConfig, Classify, FailureKind, Invocation,
//!     RetryExecutor, RetryPolicy, Timed, TimeoutGuard,
//! };
//!
//! #[derive(Debug)]
//! struct Unavailable;
//!
//! impl std::fmt::Display for Unavailable {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("unavailable")
//!     }
//! }
//!
//! impl Classify for Unavailable {
//!     fn failure_kind(&self) -> FailureKind {
//!         FailureKind::ServerError
//!     }
//! }
//!
//! let breaker = CircuitBreaker::new("embeddings", CircuitConfig::default());
//! let retry = RetryExecutor::new(RetryPolicy::no_retry());
//!
//! // One breaker verdict per retried sequence: the breaker wraps the retry.
//! let mut call = Timed::new(TimeoutGuard::new(Duration::from_secs(5)), || {
//!     Ok::<_, Unavailable>(vec![0.1_f32, 0.2])
//! })
//! .with_retry(retry)
//! .with_breaker(breaker);
//!
//! let embedding = call.run(&CancelToken::new()).unwrap();
//! assert_eq!(embedding.len(), 2);
//! ```
//!
//! Wrapping the other way round, `with_breaker(..).with_retry(..)`, makes
//! every attempt a separate breaker call: each one is gated and counted.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::cancel::CancelToken;
use crate::error::{FailoverError, FailoverResult};
use crate::kind::Classify;
use crate::retry::RetryExecutor;
use crate::timeout::TimeoutGuard;

/// A repeatable, guarded operation.
pub trait Invocation {
    /// Success value.
    type Output;
    /// Operation error.
    type Error;

    /// Runs the operation once through every layer.
    fn run(&mut self, token: &CancelToken) -> FailoverResult<Self::Output, Self::Error>;

    /// Wraps `self` in a circuit breaker.
    fn with_breaker(self, breaker: CircuitBreaker) -> WithBreaker<Self>
    where
        Self: Sized,
        Self::Error: Classify,
    {
        WithBreaker {
            breaker,
            inner: self,
        }
    }

    /// Wraps `self` in a retry loop.
    fn with_retry(self, executor: RetryExecutor) -> WithRetry<Self>
    where
        Self: Sized,
        Self::Error: Classify + std::fmt::Display,
    {
        WithRetry {
            executor,
            inner: self,
        }
    }
}

/// An unguarded operation; the innermost layer.
pub struct Call<F, T, E> {
    op: F,
    _types: PhantomData<fn() -> (T, E)>,
}

impl<F, T, E> Call<F, T, E>
where
    F: FnMut() -> Result<T, E>,
{
    /// Wraps a closure.
    pub fn new(op: F) -> Self {
        Self {
            op,
            _types: PhantomData,
        }
    }
}

impl<F, T, E> Invocation for Call<F, T, E>
where
    F: FnMut() -> Result<T, E>,
{
    type Output = T;
    type Error = E;

    fn run(&mut self, token: &CancelToken) -> FailoverResult<T, E> {
        if token.is_cancelled() {
            return Err(FailoverError::Cancelled);
        }
        (self.op)().map_err(FailoverError::Operation)
    }
}

/// An operation bounded by a [`TimeoutGuard`]; the innermost layer.
///
/// Each run executes the operation on a worker thread, which is why the
/// closure must be shareable and `'static`.
pub struct Timed<F, T, E> {
    guard: TimeoutGuard,
    op: Arc<F>,
    _types: PhantomData<fn() -> (T, E)>,
}

impl<F, T, E> Timed<F, T, E>
where
    F: Fn() -> Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wraps a closure with a time budget.
    pub fn new(guard: TimeoutGuard, op: F) -> Self {
        Self {
            guard,
            op: Arc::new(op),
            _types: PhantomData,
        }
    }
}

impl<F, T, E> Invocation for Timed<F, T, E>
where
    F: Fn() -> Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;

    fn run(&mut self, token: &CancelToken) -> FailoverResult<T, E> {
        let op = Arc::clone(&self.op);
        self.guard.run_cancellable(token, move || op())
    }
}

/// A layer gating its inner invocation with a circuit breaker.
pub struct WithBreaker<I> {
    breaker: CircuitBreaker,
    inner: I,
}

impl<I> WithBreaker<I> {
    /// The breaker of this layer.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl<I> Invocation for WithBreaker<I>
where
    I: Invocation,
    I::Error: Classify,
{
    type Output = I::Output;
    type Error = I::Error;

    fn run(&mut self, token: &CancelToken) -> FailoverResult<I::Output, I::Error> {
        let episode = self.breaker.pre_call()?;
        let start = Instant::now();
        let result = self.inner.run(token);
        self.breaker.settle(episode, &result, start.elapsed());
        result
    }
}

/// A layer retrying its inner invocation.
pub struct WithRetry<I> {
    executor: RetryExecutor,
    inner: I,
}

impl<I> Invocation for WithRetry<I>
where
    I: Invocation,
    I::Error: Classify + std::fmt::Display,
{
    type Output = I::Output;
    type Error = I::Error;

    fn run(&mut self, token: &CancelToken) -> FailoverResult<I::Output, I::Error> {
        let inner = &mut self.inner;
        self.executor.execute(token, |_| inner.run(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use crate::kind::FailureKind;
    use crate::retry::RetryPolicy;
    use crate::state::State;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Flaky;

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("flaky")
        }
    }

    impl Classify for Flaky {
        fn failure_kind(&self) -> FailureKind {
            FailureKind::ServerError
        }
    }

    fn retry(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5), 2.0)
                .unwrap(),
        )
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        let config = CircuitConfig::builder()
            .failure_threshold(threshold)
            .build()
            .unwrap();
        CircuitBreaker::new("layered", config)
    }

    #[test]
    fn breaker_outside_retry_counts_one_failure() {
        let breaker = breaker(3);
        let mut calls = 0;
        let mut invocation = Call::new(|| {
            calls += 1;
            Err::<(), _>(Flaky)
        })
        .with_retry(retry(2))
        .with_breaker(breaker.clone());

        assert!(invocation.run(&CancelToken::new()).is_err());
        drop(invocation);
        assert_eq!(calls, 3);
        let stats = breaker.stats();
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[test]
    fn breaker_inside_retry_counts_every_attempt() {
        let breaker = breaker(2);
        let mut invocation = Call::new(|| Err::<(), _>(Flaky))
            .with_breaker(breaker.clone())
            .with_retry(retry(4));

        let result = invocation.run(&CancelToken::new());
        // Two counted failures trip the breaker; the third attempt is rejected
        // and rejections are not retried.
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.stats().failed_calls, 2);
    }

    #[test]
    fn timed_layer_times_out_each_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let mut invocation = Timed::new(TimeoutGuard::new(Duration::from_millis(10)), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            Ok::<_, Flaky>(())
        })
        .with_retry(retry(1));

        let result = invocation.run(&CancelToken::new());
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_token_skips_the_call() {
        let token = CancelToken::new();
        token.cancel();
        let mut invocation = Call::new(|| Ok::<_, Flaky>(1)).with_breaker(breaker(1));
        assert!(invocation.run(&token).unwrap_err().is_cancelled());
        assert_eq!(invocation.breaker().stats().total_calls, 0);
    }
}
