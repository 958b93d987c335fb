//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use provider_failover::prelude::*;
//! ```

pub use crate::{
    CancelToken, CircuitBreaker, CircuitConfig, Classify, Dependency, FailoverError,
    FailoverResult, FailureKind, FallbackChain, Invocation, RetryExecutor, RetryPolicy, State,
};
