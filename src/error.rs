//! Error types for breakers, retries and fallback chains.

use std::time::Duration;

use smallvec::SmallVec;
use thiserror::Error;

use crate::kind::{Classify, FailureKind};

/// Result type for guarded operations.
pub type FailoverResult<T, E> = Result<T, FailoverError<E>>;

/// Names of the dependencies touched by a chain call.
pub type DependencyNames = SmallVec<[String; 4]>;

/// Error returned by every guarded operation.
#[derive(Debug, Error)]
pub enum FailoverError<E> {
    /// The wrapped operation itself failed.
    #[error("operation failed: {0}")]
    Operation(#[source] E),

    /// The circuit for this dependency is open; no call was attempted.
    #[error("circuit breaker for `{dependency}` is open")]
    CircuitOpen {
        /// Name of the rejecting breaker.
        dependency: String,
    },

    /// No result arrived within the time budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call, or its deadline passed, between attempts.
    #[error("operation cancelled")]
    Cancelled,

    /// The worker thread for a timed attempt could not be started. A local
    /// resource problem, never blamed on the dependency.
    #[error("could not start timeout worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Every dependency in a fallback chain was skipped or exhausted.
    #[error("all dependencies failed (attempted: {attempted:?}, skipped: {skipped:?})")]
    ChainExhausted {
        /// Dependencies whose retries were exhausted, in the order tried.
        attempted: DependencyNames,
        /// Dependencies skipped because their circuit was open.
        skipped: DependencyNames,
        /// The last underlying failure, if any dependency was attempted.
        last: Option<Box<FailoverError<E>>>,
    },
}

impl<E> FailoverError<E> {
    /// Returns true if this is a circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, FailoverError::CircuitOpen { .. })
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FailoverError::Timeout(_))
    }

    /// Returns true if the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FailoverError::Cancelled)
    }

    /// The underlying operation error, if this is one.
    pub fn operation(&self) -> Option<&E> {
        match self {
            FailoverError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Consumes the error and returns the underlying operation error.
    ///
    /// For an exhausted chain this is the last dependency's error.
    pub fn into_operation(self) -> Option<E> {
        match self {
            FailoverError::Operation(e) => Some(e),
            FailoverError::ChainExhausted { last, .. } => last.and_then(|e| e.into_operation()),
            _ => None,
        }
    }
}

impl<E: Classify> FailoverError<E> {
    /// The failure kind this error counts as.
    ///
    /// Rejections, cancellations, spawn failures and exhausted chains are not
    /// dependency failures and return `None`.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FailoverError::Operation(e) => Some(e.failure_kind()),
            FailoverError::Timeout(_) => Some(FailureKind::Timeout),
            FailoverError::CircuitOpen { .. }
            | FailoverError::Cancelled
            | FailoverError::Spawn(_)
            | FailoverError::ChainExhausted { .. } => None,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A count that must be positive was zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    /// A duration given in seconds was negative or not finite.
    #[error("`{field}` must be a finite, non-negative number of seconds (got {value})")]
    InvalidSeconds {
        /// Field name.
        field: &'static str,
        /// Offending value, formatted.
        value: String,
    },

    /// The exponential base of a backoff was below one or not finite.
    #[error("`exponential_base` must be finite and at least 1.0 (got {0})")]
    InvalidExponentialBase(String),

    /// A fallback chain was given no dependencies.
    #[error("a fallback chain needs at least one dependency")]
    EmptyChain,

    /// Two dependencies share a name.
    #[error("duplicate dependency name `{0}`")]
    DuplicateDependency(String),
}
