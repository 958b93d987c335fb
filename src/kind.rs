//! Failure classification.
//!
//! Breakers and retry executors never inspect an operation's error directly.
//! They ask it for a [`FailureKind`] and compare that against a configured
//! [`FailureKinds`] set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Category of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call did not finish within its time budget.
    Timeout,
    /// The backend could not be reached, or the connection dropped.
    Connection,
    /// The backend throttled the caller.
    RateLimited,
    /// The backend reported an internal or overload error.
    ServerError,
    /// The request was rejected as malformed.
    InvalidRequest,
    /// Credentials were missing or refused.
    Authentication,
    /// Anything else, including defects in the calling code.
    Other,
}

impl FailureKind {
    const ALL: [FailureKind; 7] = [
        FailureKind::Timeout,
        FailureKind::Connection,
        FailureKind::RateLimited,
        FailureKind::ServerError,
        FailureKind::InvalidRequest,
        FailureKind::Authentication,
        FailureKind::Other,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::RateLimited => "rate-limited",
            FailureKind::ServerError => "server-error",
            FailureKind::InvalidRequest => "invalid-request",
            FailureKind::Authentication => "authentication",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A set of [`FailureKind`]s.
///
/// Deserializes from and serializes to a list, e.g. `["timeout", "connection"]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<FailureKind>", into = "Vec<FailureKind>")]
pub struct FailureKinds(u8);

impl FailureKinds {
    /// The empty set.
    pub const fn none() -> Self {
        Self(0)
    }

    /// Every kind, including [`FailureKind::Other`].
    pub fn all() -> Self {
        FailureKind::ALL.into_iter().collect()
    }

    /// The transient kinds: timeouts, connection errors, throttling and
    /// server-side errors. Used as the default for both breakers and retries.
    pub fn transient() -> Self {
        [
            FailureKind::Timeout,
            FailureKind::Connection,
            FailureKind::RateLimited,
            FailureKind::ServerError,
        ]
        .into_iter()
        .collect()
    }

    /// Returns true if `kind` is in the set.
    pub fn contains(&self, kind: FailureKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns the set with `kind` added.
    pub fn with(self, kind: FailureKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Returns the set with `kind` removed.
    pub fn without(self, kind: FailureKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    /// Returns the kinds present in both sets.
    pub fn intersection(self, other: FailureKinds) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the kinds in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = FailureKind> + '_ {
        FailureKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl Default for FailureKinds {
    fn default() -> Self {
        Self::transient()
    }
}

impl fmt::Debug for FailureKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<FailureKind> for FailureKinds {
    fn from_iter<I: IntoIterator<Item = FailureKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), FailureKinds::with)
    }
}

impl From<Vec<FailureKind>> for FailureKinds {
    fn from(kinds: Vec<FailureKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<FailureKinds> for Vec<FailureKind> {
    fn from(kinds: FailureKinds) -> Self {
        kinds.iter().collect()
    }
}

/// Errors that can say which [`FailureKind`] they belong to.
///
/// Implemented by the error type of every operation passed to a breaker,
/// retry executor or fallback chain.
pub trait Classify {
    /// The category of this failure.
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => FailureKind::Connection,
            io::ErrorKind::PermissionDenied => FailureKind::Authentication,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                FailureKind::InvalidRequest
            }
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_excludes_caller_errors() {
        let kinds = FailureKinds::transient();
        assert!(kinds.contains(FailureKind::Timeout));
        assert!(kinds.contains(FailureKind::RateLimited));
        assert!(!kinds.contains(FailureKind::InvalidRequest));
        assert!(!kinds.contains(FailureKind::Other));
    }

    #[test]
    fn with_and_without() {
        let kinds = FailureKinds::none()
            .with(FailureKind::Connection)
            .with(FailureKind::Timeout)
            .without(FailureKind::Timeout);
        assert_eq!(kinds.iter().collect::<Vec<_>>(), vec![FailureKind::Connection]);
        assert!(FailureKinds::none().is_empty());
        let both = FailureKinds::transient().intersection(FailureKinds::none().with(FailureKind::Timeout));
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![FailureKind::Timeout]);
        assert_eq!(FailureKinds::all().iter().count(), 7);
    }

    #[test]
    fn io_errors_classify() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(err.failure_kind(), FailureKind::Connection);
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(err.failure_kind(), FailureKind::Timeout);
        let err = io::Error::new(io::ErrorKind::Other, "?");
        assert_eq!(err.failure_kind(), FailureKind::Other);
    }
}
