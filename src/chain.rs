//! Prioritized fallback across interchangeable backends.
//!
//! A [`FallbackChain`] holds one [`CircuitBreaker`] and one lazily created
//! client per [`Dependency`]. A call walks the dependencies in ascending
//! priority, skips those whose circuit refuses it, retries each admitted one
//! with the chain's [`RetryExecutor`] (every attempt bounded by the
//! dependency's request timeout), and returns the first success.
//!
//! A dependency whose retries run out records exactly **one** failure on its
//! breaker, however many attempts it took. Retry storms against a struggling
//! backend therefore cannot trip its circuit faster than real outages do.

use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use once_cell::sync::OnceCell;

use crate::breaker::CircuitBreaker;
use crate::cancel::CancelToken;
use crate::config::{CircuitConfig, DependencyConfig, FailoverConfig};
use crate::error::{ConfigError, DependencyNames, FailoverError, FailoverResult};
use crate::kind::Classify;
use crate::metrics::{CircuitStats, MetricSink, NullMetricSink};
use crate::registry::BreakerRegistry;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::state::State;
use crate::timeout::TimeoutGuard;

/// One backend: its identity, priority and the parameters handed to the
/// client factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    name: String,
    priority: i32,
    provider: String,
    model: Option<String>,
    credentials_ref: Option<String>,
    base_url: Option<String>,
}

impl Dependency {
    /// Creates a dependency with priority 0.
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            provider: provider.into(),
            model: None,
            credentials_ref: None,
            base_url: None,
        }
    }

    /// Sets the priority; lower values are tried first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the credentials reference.
    pub fn with_credentials_ref(mut self, reference: impl Into<String>) -> Self {
        self.credentials_ref = Some(reference.into());
        self
    }

    /// Sets the endpoint override.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Unique name; also the name of its breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the chain; lower is earlier.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Provider identifier.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Model identifier, if configured.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Credentials reference, if configured.
    pub fn credentials_ref(&self) -> Option<&str> {
        self.credentials_ref.as_deref()
    }

    /// Endpoint override, if configured.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }
}

impl From<&DependencyConfig> for Dependency {
    fn from(config: &DependencyConfig) -> Self {
        Self {
            name: config.name.clone(),
            priority: config.priority,
            provider: config.provider.clone(),
            model: config.model.clone(),
            credentials_ref: config.credentials_ref.clone(),
            base_url: config.base_url.clone(),
        }
    }
}

/// Creates the client used to talk to a dependency.
///
/// Called at most once per dependency on success; a failed creation is
/// retried by the next attempt. Closures `Fn(&Dependency) -> Result<C, E>`
/// implement this trait.
pub trait ClientFactory: Send + Sync + 'static {
    /// The client; shared across concurrent calls.
    type Client: Send + Sync + 'static;
    /// Error of both client creation and calls made with the client.
    type Error: Classify + std::fmt::Display + Send + 'static;

    /// Builds a client for `dependency`.
    fn create(&self, dependency: &Dependency) -> Result<Self::Client, Self::Error>;
}

impl<F, C, E> ClientFactory for F
where
    F: Fn(&Dependency) -> Result<C, E> + Send + Sync + 'static,
    C: Send + Sync + 'static,
    E: Classify + std::fmt::Display + Send + 'static,
{
    type Client = C;
    type Error = E;

    fn create(&self, dependency: &Dependency) -> Result<C, E> {
        self(dependency)
    }
}

struct Member<C> {
    dependency: Arc<Dependency>,
    breaker: CircuitBreaker,
    /// Retries only what `breaker` tracks.
    retry: RetryExecutor,
    client: OnceCell<Arc<C>>,
}

impl<C> Member<C> {
    fn client<F>(&self, factory: &F) -> Result<Arc<C>, F::Error>
    where
        F: ClientFactory<Client = C>,
    {
        self.client
            .get_or_try_init(|| {
                tracing::debug!(dependency = %self.dependency.name, "creating client");
                factory.create(&self.dependency).map(Arc::new)
            })
            .map(Arc::clone)
    }
}

/// Per-dependency view returned by [`FallbackChain::health`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyHealth {
    /// Dependency name.
    pub name: String,
    /// Dependency priority.
    pub priority: i32,
    /// True while the circuit refuses calls.
    pub circuit_open: bool,
    /// Current run of tracked failures.
    pub consecutive_failures: u32,
    /// `!circuit_open`
    pub healthy: bool,
}

/// Monitoring snapshot of a whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHealth {
    /// Dependencies in chain order.
    pub dependencies: Vec<DependencyHealth>,
    /// Number of dependencies whose circuit is not open.
    pub healthy_count: usize,
}

/// What a failed dependency means for the rest of the call.
enum Verdict<E> {
    /// Record nothing more and try the next dependency.
    FallThrough(FailoverError<E>),
    /// Stop and hand the error to the caller.
    Propagate(FailoverError<E>),
}

/// Ordered set of breaker-guarded backends tried until one succeeds.
pub struct FallbackChain<F: ClientFactory> {
    members: Vec<Member<F::Client>>,
    factory: F,
    metric_sink: Arc<dyn MetricSink>,
}

impl<F: ClientFactory> std::fmt::Debug for FallbackChain<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field(
                "dependencies",
                &self.members.iter().map(|m| m.dependency.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl<F: ClientFactory> FallbackChain<F> {
    /// Starts building a chain around `factory`.
    pub fn builder(factory: F) -> FallbackChainBuilder<F> {
        FallbackChainBuilder::new(factory)
    }

    /// Builds a chain from deserialized configuration.
    pub fn from_config(
        config: &FailoverConfig,
        factory: F,
        registry: Option<&BreakerRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::builder(factory).retry(RetryPolicy::try_from(&config.retry)?);
        if let Some(registry) = registry {
            builder = builder.registry(registry);
        }
        for dependency in &config.dependencies {
            let settings = dependency.breaker.as_ref().unwrap_or(&config.breaker);
            builder = builder.dependency(Dependency::from(dependency), CircuitConfig::try_from(settings)?);
        }
        builder.build()
    }

    /// Dependencies in the order they are tried.
    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> + '_ {
        self.members.iter().map(|m| m.dependency.as_ref())
    }

    /// The breaker of the named dependency.
    pub fn breaker(&self, name: &str) -> Option<&CircuitBreaker> {
        self.member(name).map(|m| &m.breaker)
    }

    fn member(&self, name: &str) -> Option<&Member<F::Client>> {
        self.members.iter().find(|m| m.dependency.name == name)
    }

    /// Calls `op` against the dependencies in priority order until one
    /// succeeds.
    ///
    /// Every attempt runs on a worker thread bounded by the dependency's
    /// request timeout; see [`TimeoutGuard::run`].
    pub fn call<T, Op>(&self, op: Op) -> FailoverResult<T, F::Error>
    where
        Op: Fn(&F::Client, &Dependency) -> Result<T, F::Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.call_cancellable(&CancelToken::new(), op)
    }

    /// Like [`call`](Self::call), unwinding with
    /// [`FailoverError::Cancelled`] once `token` is cancelled.
    pub fn call_cancellable<T, Op>(&self, token: &CancelToken, op: Op) -> FailoverResult<T, F::Error>
    where
        Op: Fn(&F::Client, &Dependency) -> Result<T, F::Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let mut attempted = DependencyNames::new();
        let mut skipped = DependencyNames::new();
        let mut last = None;

        for member in &self.members {
            if token.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }
            let name = member.dependency.name();
            let Some(episode) = member.breaker.admit() else {
                skipped.push(name.to_string());
                continue;
            };
            attempted.push(name.to_string());

            let result = self.attempt(member, token, &op);
            match self.judge(member, episode, result) {
                Ok(value) => return Ok(value),
                Err(Verdict::Propagate(error)) => return Err(error),
                Err(Verdict::FallThrough(error)) => last = Some(Box::new(error)),
            }
        }

        Err(self.exhausted(attempted, skipped, last))
    }

    fn attempt<T, Op>(
        &self,
        member: &Member<F::Client>,
        token: &CancelToken,
        op: &Arc<Op>,
    ) -> FailoverResult<T, F::Error>
    where
        Op: Fn(&F::Client, &Dependency) -> Result<T, F::Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let guard = TimeoutGuard::new(member.breaker.config().request_timeout());
        let started = Cell::new(Instant::now());

        member.retry.execute_observed(
            token,
            |_| {
                started.set(Instant::now());
                let client = member.client(&self.factory).map_err(FailoverError::Operation)?;
                let op = Arc::clone(op);
                let dependency = Arc::clone(&member.dependency);
                guard.run_cancellable(token, move || op(&client, &dependency))
            },
            |attempt, outcome| self.observe(member, attempt, outcome, started.get().elapsed()),
        )
    }

    /// Reports one attempt to the metric sink.
    fn observe<T>(
        &self,
        member: &Member<F::Client>,
        attempt: u32,
        outcome: &FailoverResult<T, F::Error>,
        elapsed: Duration,
    ) {
        let name = member.dependency.name();
        match outcome {
            Ok(_) => self.metric_sink.record_call(name, true, elapsed),
            Err(error) if error.failure_kind().is_some() => {
                self.metric_sink.record_call(name, false, elapsed);
                let policy = member.retry.policy();
                if attempt < policy.max_retries() && policy.is_retryable(error) {
                    self.metric_sink.record_retry(name, attempt);
                }
            }
            Err(_) => {}
        }
    }

    /// Turns a dependency's final outcome into one breaker verdict.
    fn judge<T>(
        &self,
        member: &Member<F::Client>,
        episode: u64,
        result: FailoverResult<T, F::Error>,
    ) -> Result<T, Verdict<F::Error>> {
        let breaker = &member.breaker;
        let error = match result {
            Ok(value) => {
                breaker.succeeded(Some(episode));
                return Ok(value);
            }
            Err(error) => error,
        };

        let Some(kind) = error.failure_kind() else {
            // Cancelled, or a local failure: not the dependency's fault.
            breaker.released(Some(episode));
            return Err(Verdict::Propagate(error));
        };

        breaker.failed(kind, Some(episode));
        if !breaker.config().tracked_failures().contains(kind) {
            tracing::debug!(dependency = %breaker.name(), %kind, %error, "untracked failure, not falling back");
            return Err(Verdict::Propagate(error));
        }

        tracing::warn!(dependency = %breaker.name(), %error, "dependency exhausted, falling back");
        Err(Verdict::FallThrough(error))
    }

    fn exhausted(
        &self,
        attempted: DependencyNames,
        skipped: DependencyNames,
        last: Option<Box<FailoverError<F::Error>>>,
    ) -> FailoverError<F::Error> {
        tracing::warn!(?attempted, ?skipped, "every dependency failed or was skipped");
        FailoverError::ChainExhausted {
            attempted,
            skipped,
            last,
        }
    }

    /// Monitoring snapshot. Calls always re-check live circuit state.
    pub fn health(&self) -> ChainHealth {
        let dependencies: Vec<_> = self
            .members
            .iter()
            .map(|member| {
                let stats = member.breaker.stats();
                let circuit_open = stats.state == State::Open;
                DependencyHealth {
                    name: member.dependency.name.clone(),
                    priority: member.dependency.priority,
                    circuit_open,
                    consecutive_failures: stats.consecutive_failures,
                    healthy: !circuit_open,
                }
            })
            .collect();
        let healthy_count = dependencies.iter().filter(|d| d.healthy).count();

        ChainHealth {
            dependencies,
            healthy_count,
        }
    }

    /// Statistics of every breaker, in chain order.
    pub fn stats(&self) -> Vec<CircuitStats> {
        self.members.iter().map(|m| m.breaker.stats()).collect()
    }

    /// Forces the named dependency's circuit closed. Returns false for an
    /// unknown name.
    pub fn reset(&self, name: &str) -> bool {
        match self.member(name) {
            Some(member) => {
                member.breaker.reset();
                true
            }
            None => false,
        }
    }
}

#[cfg(feature = "async")]
impl<F: ClientFactory> FallbackChain<F> {
    /// Async version of [`call_cancellable`](Self::call_cancellable).
    ///
    /// `op` receives shared handles to the client and dependency so the
    /// returned future can own them. Timeouts drop the future.
    pub async fn call_async<T, Op, Fut>(&self, token: &CancelToken, op: Op) -> FailoverResult<T, F::Error>
    where
        Op: Fn(Arc<F::Client>, Arc<Dependency>) -> Fut,
        Fut: std::future::Future<Output = Result<T, F::Error>>,
    {
        let op = &op;
        let mut attempted = DependencyNames::new();
        let mut skipped = DependencyNames::new();
        let mut last = None;

        for member in &self.members {
            if token.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }
            let name = member.dependency.name();
            let Some(episode) = member.breaker.admit() else {
                skipped.push(name.to_string());
                continue;
            };
            attempted.push(name.to_string());

            let guard = TimeoutGuard::new(member.breaker.config().request_timeout());
            let started = Cell::new(Instant::now());
            let result = member
                .retry
                .execute_async_observed(
                    token,
                    |_| {
                        started.set(Instant::now());
                        let client = member.client(&self.factory);
                        let dependency = Arc::clone(&member.dependency);
                        async move {
                            match client {
                                Ok(client) => guard.run_async(token, op(client, dependency)).await,
                                Err(error) => Err(FailoverError::Operation(error)),
                            }
                        }
                    },
                    |attempt, outcome| self.observe(member, attempt, outcome, started.get().elapsed()),
                )
                .await;

            match self.judge(member, episode, result) {
                Ok(value) => return Ok(value),
                Err(Verdict::Propagate(error)) => return Err(error),
                Err(Verdict::FallThrough(error)) => last = Some(Box::new(error)),
            }
        }

        Err(self.exhausted(attempted, skipped, last))
    }
}

/// Builder for [`FallbackChain`].
pub struct FallbackChainBuilder<F: ClientFactory> {
    factory: F,
    entries: Vec<(Dependency, CircuitConfig)>,
    retry: RetryPolicy,
    metric_sink: Arc<dyn MetricSink>,
    registry: Option<BreakerRegistry>,
}

impl<F: ClientFactory> FallbackChainBuilder<F> {
    /// Creates a builder with the default retry policy and no metrics.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            entries: Vec::new(),
            retry: RetryPolicy::default(),
            metric_sink: Arc::new(NullMetricSink),
            registry: None,
        }
    }

    /// Adds a dependency with its breaker configuration.
    pub fn dependency(mut self, dependency: Dependency, breaker: CircuitConfig) -> Self {
        self.entries.push((dependency, breaker));
        self
    }

    /// Sets the retry policy shared by all dependencies.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets a metric sink for the chain and its breakers.
    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Registers the chain's breakers with `registry` on build.
    pub fn registry(mut self, registry: &BreakerRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Validates the dependencies and builds the chain.
    pub fn build(self) -> Result<FallbackChain<F>, ConfigError> {
        if self.entries.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        let mut seen = AHashSet::with_capacity(self.entries.len());
        for (dependency, _) in &self.entries {
            if !seen.insert(dependency.name.as_str()) {
                return Err(ConfigError::DuplicateDependency(dependency.name.clone()));
            }
        }

        let mut entries = self.entries;
        // stable: equal priorities keep insertion order
        entries.sort_by_key(|(dependency, _)| dependency.priority);

        let members: Vec<_> = entries
            .into_iter()
            .map(|(dependency, config)| {
                let retryable = self.retry.retryable_failures().intersection(config.tracked_failures());
                let retry = RetryExecutor::new(self.retry.clone().with_retryable_failures(retryable));
                let breaker = CircuitBreaker::with_metric_sink(
                    dependency.name.clone(),
                    config,
                    Arc::clone(&self.metric_sink),
                );
                if let Some(registry) = &self.registry {
                    registry.register(&breaker);
                }
                Member {
                    dependency: Arc::new(dependency),
                    breaker,
                    retry,
                    client: OnceCell::new(),
                }
            })
            .collect();

        tracing::debug!(
            dependencies = ?members.iter().map(|m| m.dependency.name()).collect::<Vec<_>>(),
            "fallback chain built"
        );

        Ok(FallbackChain {
            members,
            factory: self.factory,
            metric_sink: self.metric_sink,
        })
    }
}
