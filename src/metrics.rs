//! Call statistics and metric sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::state::State;

/// Trait for metrics sinks that can receive circuit breaker events.
///
/// Sinks are called outside any breaker lock and must not block.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition of the named breaker.
    fn record_state_transition(&self, dependency: &str, from: State, to: State);

    /// Records the outcome and duration of one attempted call.
    fn record_call(&self, dependency: &str, success: bool, duration: Duration);

    /// Records a call refused by an open circuit.
    fn record_rejection(&self, dependency: &str);

    /// Records that a retry was scheduled after the failed attempt `attempt`.
    fn record_retry(&self, dependency: &str, attempt: u32);
}

/// A null metrics sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _dependency: &str, _from: State, _to: State) {}
    fn record_call(&self, _dependency: &str, _success: bool, _duration: Duration) {}
    fn record_rejection(&self, _dependency: &str) {}
    fn record_retry(&self, _dependency: &str, _attempt: u32) {}
}

/// Snapshot of one breaker's state and history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    /// Breaker name.
    pub name: String,
    /// Current state, with the lazy Open → HalfOpen transition applied.
    pub state: State,
    /// Attempted calls: `successful_calls + failed_calls`.
    pub total_calls: u64,
    /// Attempted calls that succeeded.
    pub successful_calls: u64,
    /// Attempted calls that failed, tracked kind or not.
    pub failed_calls: u64,
    /// Calls refused without an attempt.
    pub rejected_calls: u64,
    /// Current run of tracked failures.
    pub consecutive_failures: u32,
    /// When the last tracked failure was recorded.
    pub last_failure: Option<Instant>,
    /// When the last success was recorded.
    pub last_success: Option<Instant>,
}

/// Cumulative counters, updated without taking the breaker lock.
#[derive(Debug, Default)]
pub(crate) struct CallCounters {
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl CallCounters {
    pub fn record_success(&self) {
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// `(successful, failed, rejected)`
    pub fn load(&self) -> (u64, u64, u64) {
        (
            self.successful.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = CallCounters::default();
        counters.record_success();
        counters.record_success();
        counters.record_failure();
        counters.record_rejection();
        assert_eq!(counters.load(), (2, 1, 1));
    }
}
