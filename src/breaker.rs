//! Core circuit breaker implementation.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::CircuitConfig;
use crate::error::{FailoverError, FailoverResult};
use crate::kind::{Classify, FailureKind};
use crate::metrics::{CallCounters, CircuitStats, MetricSink, NullMetricSink};
use crate::state::{CircuitRuntime, State, Transition};
use crate::timeout::TimeoutGuard;

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner {
    name: String,
    config: CircuitConfig,
    runtime: Mutex<CircuitRuntime>,
    counters: CallCounters,
    metric_sink: Arc<dyn MetricSink>,
}

/// A circuit breaker guarding calls to one dependency.
///
/// Cloning is cheap and yields a handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_metric_sink(name, config, Arc::new(NullMetricSink))
    }

    /// Creates a new circuit breaker reporting to `metric_sink`.
    pub fn with_metric_sink(
        name: impl Into<String>,
        config: CircuitConfig,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        let inner = BreakerInner {
            name: name.into(),
            config,
            runtime: Mutex::new(CircuitRuntime::new()),
            counters: CallCounters::default(),
            metric_sink,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// The dependency name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The breaker's configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.inner.config
    }

    /// Gets the current state, applying the lazy Open → HalfOpen transition.
    pub fn state(&self) -> State {
        let (state, transition) = self.inner.runtime.lock().resolve(&self.inner.config, Instant::now());
        self.report(transition);
        state
    }

    /// Checks whether a call may be attempted now.
    ///
    /// In half-open state a `true` admits the caller as one of the limited
    /// probes; the caller must then report exactly one of
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release_probe`](Self::release_probe).
    ///
    /// These reports are not tied to the admission: a success reported after
    /// the circuit reopened and half-opened again counts toward the new
    /// episode. [`call`](Self::call) and the fallback chain tie them.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), returning the half-open
    /// episode the call was admitted in.
    pub(crate) fn admit(&self) -> Option<u64> {
        let (admitted, transition) = self.inner.runtime.lock().allow(&self.inner.config, Instant::now());
        self.report(transition);

        if admitted.is_none() {
            self.inner.counters.record_rejection();
            self.inner.metric_sink.record_rejection(&self.inner.name);
            tracing::debug!(dependency = %self.inner.name, "call rejected, circuit open");
        }
        admitted
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        self.succeeded(None);
    }

    pub(crate) fn succeeded(&self, admitted_in: Option<u64>) {
        self.inner.counters.record_success();
        let transition = self
            .inner
            .runtime
            .lock()
            .on_success(&self.inner.config, Instant::now(), admitted_in);
        self.report(transition);
    }

    /// Records a failed call of the given kind.
    ///
    /// Kinds outside the configured tracked set are counted in the stats but
    /// leave the state machine untouched.
    pub fn record_failure(&self, kind: FailureKind) {
        self.failed(kind, None);
    }

    pub(crate) fn failed(&self, kind: FailureKind, admitted_in: Option<u64>) {
        self.inner.counters.record_failure();

        if !self.inner.config.tracked_failures().contains(kind) {
            self.inner.runtime.lock().release_probe(admitted_in);
            tracing::debug!(dependency = %self.inner.name, %kind, "untracked failure ignored by breaker");
            return;
        }

        let transition = self.inner.runtime.lock().on_failure(&self.inner.config, Instant::now());
        self.report(transition);
    }

    /// Gives back the half-open probe slot of an admitted call that ended
    /// without a verdict, e.g. because it was cancelled.
    pub fn release_probe(&self) {
        self.released(None);
    }

    pub(crate) fn released(&self, admitted_in: Option<u64>) {
        self.inner.runtime.lock().release_probe(admitted_in);
    }

    /// Executes a function wrapped by the circuit breaker.
    pub fn call<F, T, E>(&self, f: F) -> FailoverResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Classify,
    {
        let episode = self.pre_call()?;

        let start = Instant::now();
        let result = f().map_err(FailoverError::Operation);
        self.settle(episode, &result, start.elapsed());

        result
    }

    /// Executes a function wrapped by the circuit breaker, bounded by the
    /// configured request timeout.
    ///
    /// The function runs on a worker thread; see [`TimeoutGuard::run`] for
    /// what happens to it after a timeout.
    pub fn call_with_timeout<F, T, E>(&self, f: F) -> FailoverResult<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Classify + Send + 'static,
    {
        let episode = self.pre_call()?;

        let start = Instant::now();
        let result = TimeoutGuard::new(self.inner.config.request_timeout()).run(f);
        self.settle(episode, &result, start.elapsed());

        result
    }

    /// Admits a call, or builds its rejection.
    pub(crate) fn pre_call<E>(&self) -> Result<u64, FailoverError<E>> {
        self.admit().ok_or_else(|| FailoverError::CircuitOpen {
            dependency: self.inner.name.clone(),
        })
    }

    /// Feeds the outcome of an admitted call back into the breaker.
    pub(crate) fn settle<T, E: Classify>(
        &self,
        episode: u64,
        result: &FailoverResult<T, E>,
        duration: Duration,
    ) {
        match result {
            Ok(_) => {
                self.inner.metric_sink.record_call(&self.inner.name, true, duration);
                self.succeeded(Some(episode));
            }
            Err(error) => match error.failure_kind() {
                Some(kind) => {
                    self.inner.metric_sink.record_call(&self.inner.name, false, duration);
                    self.failed(kind, Some(episode));
                }
                None => self.released(Some(episode)),
            },
        }
    }

    /// Forces the breaker closed and clears its failure streak.
    pub fn reset(&self) {
        let transition = self.inner.runtime.lock().reset();
        tracing::info!(dependency = %self.inner.name, "circuit breaker reset");
        self.report(transition);
    }

    /// Snapshot of the breaker's statistics and resolved state.
    pub fn stats(&self) -> CircuitStats {
        let (state, transition, consecutive_failures, last_failure, last_success) = {
            let mut runtime = self.inner.runtime.lock();
            let (state, transition) = runtime.resolve(&self.inner.config, Instant::now());
            (
                state,
                transition,
                runtime.consecutive_failures(),
                runtime.last_failure(),
                runtime.last_success(),
            )
        };
        self.report(transition);

        let (successful_calls, failed_calls, rejected_calls) = self.inner.counters.load();
        CircuitStats {
            name: self.inner.name.clone(),
            state,
            total_calls: successful_calls + failed_calls,
            successful_calls,
            failed_calls,
            rejected_calls,
            consecutive_failures,
            last_failure,
            last_success,
        }
    }

    /// Logs and publishes a transition. Never called with the lock held.
    fn report(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        let name = &self.inner.name;
        match to {
            State::Open => tracing::warn!(dependency = %name, %from, "circuit opened"),
            State::HalfOpen => tracing::debug!(dependency = %name, "circuit half-open, probing"),
            State::Closed => tracing::info!(dependency = %name, %from, "circuit closed"),
        }
        self.inner.metric_sink.record_state_transition(name, from, to);
    }

    pub(crate) fn downgrade(&self) -> WeakBreaker {
        WeakBreaker(Arc::downgrade(&self.inner))
    }
}

/// Non-owning handle to a breaker.
#[derive(Clone)]
pub(crate) struct WeakBreaker(Weak<BreakerInner>);

impl WeakBreaker {
    pub fn upgrade(&self) -> Option<CircuitBreaker> {
        self.0.upgrade().map(|inner| CircuitBreaker { inner })
    }
}

// Implement Async support when the feature is enabled
#[cfg(feature = "async")]
impl CircuitBreaker {
    /// Executes an async function wrapped by the circuit breaker.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> FailoverResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Classify,
    {
        let episode = self.pre_call()?;

        let start = Instant::now();
        let result = f().await.map_err(FailoverError::Operation);
        self.settle(episode, &result, start.elapsed());

        result
    }

    /// Executes an async function wrapped by the circuit breaker, bounded by
    /// the configured request timeout. The future is dropped on timeout.
    pub async fn call_async_with_timeout<F, Fut, T, E>(&self, f: F) -> FailoverResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Classify,
    {
        let episode = self.pre_call()?;

        let start = Instant::now();
        let guard = TimeoutGuard::new(self.inner.config.request_timeout());
        let result = guard.run_async(&crate::cancel::CancelToken::new(), f()).await;
        self.settle(episode, &result, start.elapsed());

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::FailureKinds;
    use crate::metrics::testing::RecordingSink;
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    struct BackendError(FailureKind);

    impl std::fmt::Display for BackendError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "backend error: {}", self.0)
        }
    }

    impl Classify for BackendError {
        fn failure_kind(&self) -> FailureKind {
            self.0
        }
    }

    fn breaker(threshold: u32, recovery: Duration, half_open: u32) -> CircuitBreaker {
        let config = CircuitConfig::builder()
            .failure_threshold(threshold)
            .recovery_timeout(recovery)
            .half_open_max_calls(half_open)
            .request_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        CircuitBreaker::new("primary", config)
    }

    fn fail(breaker: &CircuitBreaker, kind: FailureKind) -> FailoverResult<(), BackendError> {
        breaker.call(|| Err(BackendError(kind)))
    }

    #[test]
    fn trips_after_threshold_and_fails_fast() {
        let breaker = breaker(3, Duration::from_secs(60), 1);
        for _ in 0..3 {
            assert!(fail(&breaker, FailureKind::ServerError)
                .unwrap_err()
                .operation()
                .is_some());
        }
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.allow_request());

        let mut called = false;
        let result: FailoverResult<(), BackendError> = breaker.call(|| {
            called = true;
            Ok(())
        });
        assert!(result.unwrap_err().is_circuit_open());
        assert!(!called);
    }

    #[test]
    fn untracked_failures_do_not_trip() {
        let breaker = breaker(1, Duration::from_secs(60), 1);
        for _ in 0..5 {
            let _ = fail(&breaker, FailureKind::InvalidRequest);
        }
        assert_eq!(breaker.state(), State::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.failed_calls, 5);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn recovers_through_half_open() {
        let breaker = breaker(1, Duration::from_millis(30), 2);
        let _ = fail(&breaker, FailureKind::Connection);
        assert_eq!(breaker.state(), State::Open);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), State::HalfOpen);

        assert!(breaker.call(|| Ok::<_, BackendError>(1)).is_ok());
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(breaker.call(|| Ok::<_, BackendError>(2)).is_ok());
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(30), 3);
        let _ = fail(&breaker, FailureKind::Connection);
        thread::sleep(Duration::from_millis(60));

        assert!(breaker.call(|| Ok::<_, BackendError>(())).is_ok());
        let _ = fail(&breaker, FailureKind::Timeout);
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn excluded_timeouts_do_not_count() {
        let config = CircuitConfig::builder()
            .failure_threshold(1)
            .request_timeout(Duration::from_millis(10))
            .tracked_failures(FailureKinds::transient().without(FailureKind::Timeout))
            .build()
            .unwrap();
        let breaker = CircuitBreaker::new("slow", config);

        let result: FailoverResult<(), BackendError> = breaker.call_with_timeout(|| {
            thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn timeouts_count_by_default() {
        let breaker = breaker(1, Duration::from_secs(60), 1);
        let result: FailoverResult<(), BackendError> = breaker.call_with_timeout(|| {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn stats_separate_rejections() {
        let breaker = breaker(2, Duration::from_secs(60), 1);
        let _ = breaker.call(|| Ok::<_, BackendError>(()));
        let _ = fail(&breaker, FailureKind::RateLimited);
        let _ = fail(&breaker, FailureKind::RateLimited);
        let _ = breaker.call(|| Ok::<_, BackendError>(()));
        let _ = breaker.call(|| Ok::<_, BackendError>(()));

        let stats = breaker.stats();
        assert_eq!(stats.state, State::Open);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.failed_calls, 2);
        assert_eq!(stats.total_calls, stats.successful_calls + stats.failed_calls);
        assert_eq!(stats.rejected_calls, 2);
        assert!(stats.last_failure.is_some());
        assert!(stats.last_success.is_some());
    }

    #[test]
    fn reset_closes_open_circuit() {
        let breaker = breaker(1, Duration::from_secs(60), 1);
        let _ = fail(&breaker, FailureKind::ServerError);
        assert_eq!(breaker.state(), State::Open);

        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
        assert!(breaker.call(|| Ok::<_, BackendError>(())).is_ok());
    }

    #[test]
    fn transitions_reach_the_metric_sink() {
        let sink = Arc::new(RecordingSink::default());
        let config = CircuitConfig::builder()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_millis(20))
            .half_open_max_calls(1)
            .build()
            .unwrap();
        let breaker = CircuitBreaker::with_metric_sink("sunk", config, sink.clone());

        let _ = fail(&breaker, FailureKind::Connection);
        let _ = breaker.call(|| Ok::<_, BackendError>(()));
        thread::sleep(Duration::from_millis(40));
        let _ = breaker.call(|| Ok::<_, BackendError>(()));

        let transitions: Vec<_> = sink.transitions.lock().iter().map(|t| (t.1, t.2)).collect();
        assert_eq!(
            transitions,
            vec![
                (State::Closed, State::Open),
                (State::Open, State::HalfOpen),
                (State::HalfOpen, State::Closed),
            ]
        );
        assert_eq!(sink.rejections.lock().len(), 1);
        assert_eq!(sink.calls.lock().len(), 2);
    }

    #[test]
    fn straggler_from_earlier_half_open_round_does_not_close() {
        let breaker = breaker(1, Duration::from_millis(30), 1);
        let _ = fail(&breaker, FailureKind::Connection);
        thread::sleep(Duration::from_millis(60));

        // Admitted in the first half-open round, then the round fails.
        let straggler = breaker.pre_call::<BackendError>().unwrap();
        breaker.record_failure(FailureKind::ServerError);
        assert_eq!(breaker.state(), State::Open);
        thread::sleep(Duration::from_millis(60));

        let probe = breaker.pre_call::<BackendError>().unwrap();
        breaker.settle::<(), BackendError>(straggler, &Ok(()), Duration::ZERO);
        assert_eq!(breaker.state(), State::HalfOpen);

        breaker.settle::<(), BackendError>(probe, &Ok(()), Duration::ZERO);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn concurrent_half_open_probes_are_bounded() {
        let breaker = breaker(1, Duration::from_millis(20), 2);
        let _ = fail(&breaker, FailureKind::Connection);
        thread::sleep(Duration::from_millis(40));

        let admitted: usize = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                thread::spawn(move || breaker.allow_request())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(admitted, 2);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_calls_update_state() {
        let breaker = breaker(2, Duration::from_secs(60), 1);
        for _ in 0..2 {
            let result = breaker
                .call_async(|| async { Err::<(), _>(BackendError(FailureKind::ServerError)) })
                .await;
            assert!(result.unwrap_err().operation().is_some());
        }
        let result = breaker.call_async(|| async { Ok::<_, BackendError>(()) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }
}
