//! # provider-failover
//!
//! Failure isolation and prioritized fallback for calls to third-party AI
//! backends (LLM and embedding APIs) that are slow, rate-limited or simply
//! down.
//!
//! The crate knows nothing about the backends themselves. It wraps an opaque
//! operation that either returns a value, fails, or overruns its budget, and
//! decides whether to attempt it, how often to retry it, and which backend to
//! try next.
//!
//! ## Building blocks
//!
//! - [`Backoff`] computes capped exponential delays.
//! - [`TimeoutGuard`] bounds a single attempt.
//! - [`RetryExecutor`] retries transient failures with backoff.
//! - [`CircuitBreaker`] fails fast once a dependency keeps failing, and probes
//!   it again after a recovery timeout:
//!   - **Closed**: calls pass through; consecutive tracked failures are counted.
//!   - **Open**: calls are rejected without being attempted.
//!   - **Half-Open**: a limited number of probes test whether the dependency
//!     recovered; one failure reopens, enough successes close.
//! - [`FallbackChain`] walks breaker-guarded dependencies in priority order.
//!
//! ## Basic Usage
//!
//! ```rust
//! use provider_failover::{
//!     Classify, Dependency, FailoverError, FailureKind, FallbackChain, CircuitConfig,
//! };
//!
//! #[derive(Debug)]
//! struct ApiError(u16);
//!
//! impl std::fmt::Display for ApiError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "HTTP {}", self.0)
//!     }
//! }
//!
//! impl Classify for ApiError {
//!     fn failure_kind(&self) -> FailureKind {
//!         match self.0 {
//!             429 => FailureKind::RateLimited,
//!             500..=599 => FailureKind::ServerError,
//!             _ => FailureKind::InvalidRequest,
//!         }
//!     }
//! }
//!
//! // The "client" here is just the provider name.
//! let chain = FallbackChain::builder(|dep: &Dependency| {
//!         Ok::<_, ApiError>(dep.provider().to_string())
//!     })
//!     .retry(provider_failover::RetryPolicy::no_retry())
//!     .dependency(Dependency::new("primary", "openai"), CircuitConfig::default())
//!     .dependency(
//!         Dependency::new("backup", "anthropic").with_priority(1),
//!         CircuitConfig::default(),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let answer = chain.call(|provider: &String, _dep: &Dependency| {
//!     if provider == "openai" {
//!         Err(ApiError(503))
//!     } else {
//!         Ok(format!("answered by {provider}"))
//!     }
//! });
//!
//! match answer {
//!     Ok(text) => assert_eq!(text, "answered by anthropic"),
//!     Err(FailoverError::ChainExhausted { attempted, .. }) => panic!("all failed: {attempted:?}"),
//!     Err(err) => panic!("{err}"),
//! }
//! ```
//!
//! ## Async Support
//!
//! With the `async` feature enabled, breakers, retries and chains gain
//! `*_async` entry points; timeouts then drop the future instead of
//! abandoning a worker thread.
//!
//! ```rust,ignore
//! let result = chain
//!     .call_async(&CancelToken::new(), |client, dep| async move {
//!         client.complete(&dep).await
//!     })
//!     .await;
//! ```
//!
//! ## Features
//!
//! - `std` - Standard library support (default)
//! - `async` - Async entry points with Tokio

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backoff;
mod breaker;
mod cancel;
mod chain;
mod config;
mod error;
mod guard;
mod kind;
mod metrics;
pub mod prelude;
mod registry;
mod retry;
mod state;
mod timeout;

// Re-exports
pub use backoff::Backoff;
pub use breaker::CircuitBreaker;
pub use cancel::CancelToken;
pub use chain::{
    ChainHealth, ClientFactory, Dependency, DependencyHealth, FallbackChain, FallbackChainBuilder,
};
pub use config::{
    BreakerSettings, CircuitConfig, CircuitConfigBuilder, DependencyConfig, FailoverConfig,
    RetrySettings,
};
pub use error::{ConfigError, DependencyNames, FailoverError, FailoverResult};
pub use guard::{Call, Invocation, Timed, WithBreaker, WithRetry};
pub use kind::{Classify, FailureKind, FailureKinds};
pub use metrics::{CircuitStats, MetricSink, NullMetricSink};
pub use registry::BreakerRegistry;
pub use retry::{RetryExecutor, RetryPolicy};
pub use state::State;
pub use timeout::TimeoutGuard;
