//! Circuit breaker state machine implementation.
//!
//! [`CircuitRuntime`] holds the mutable part of a breaker and implements every
//! transition as a plain method taking the current instant. It knows nothing
//! about locking; [`CircuitBreaker`](crate::CircuitBreaker) owns one behind a
//! mutex and calls into it.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::CircuitConfig;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed,

    /// Circuit is open and operations are rejected.
    Open,

    /// Circuit is allowing a limited number of operations to test recovery.
    HalfOpen,
}

impl State {
    /// Lower-case name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change, reported back so the caller can log it outside the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: State,
    pub to: State,
}

/// Mutable per-dependency breaker state.
#[derive(Debug, Clone)]
pub(crate) struct CircuitRuntime {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every entry into HalfOpen; tags admissions.
    episode: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

impl CircuitRuntime {
    pub fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            episode: 0,
            last_failure: None,
            last_success: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Current state after applying the lazy Open → HalfOpen transition.
    pub fn resolve(&mut self, config: &CircuitConfig, now: Instant) -> (State, Option<Transition>) {
        let transition = self.maybe_half_open(config, now);
        (self.state, transition)
    }

    fn maybe_half_open(&mut self, config: &CircuitConfig, now: Instant) -> Option<Transition> {
        if self.state != State::Open {
            return None;
        }
        let recovered = match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= config.recovery_timeout(),
            None => true,
        };
        if !recovered {
            return None;
        }
        self.half_open_in_flight = 0;
        self.consecutive_successes = 0;
        self.episode = self.episode.wrapping_add(1);
        Some(self.move_to(State::HalfOpen))
    }

    /// Decides whether a call may go ahead, admitting it as a probe when
    /// half-open. An admitted call gets the episode it was admitted in.
    pub fn allow(&mut self, config: &CircuitConfig, now: Instant) -> (Option<u64>, Option<Transition>) {
        let transition = self.maybe_half_open(config, now);
        let allowed = match self.state {
            State::Closed => true,
            State::Open => false,
            State::HalfOpen => {
                if self.half_open_in_flight < config.half_open_max_calls() {
                    self.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };
        (allowed.then_some(self.episode), transition)
    }

    /// True for a call admitted before the current half-open episode began.
    fn is_stale(&self, admitted_in: Option<u64>) -> bool {
        admitted_in.is_some_and(|episode| episode != self.episode)
    }

    /// Records a success. `admitted_in` is the episode returned by
    /// [`allow`](Self::allow), or `None` when the caller has no admission.
    pub fn on_success(
        &mut self,
        config: &CircuitConfig,
        now: Instant,
        admitted_in: Option<u64>,
    ) -> Option<Transition> {
        self.last_success = Some(now);
        match self.state {
            State::Closed => {
                self.consecutive_failures = 0;
                None
            }
            // A probe from an earlier episode says nothing about this one.
            State::HalfOpen if self.is_stale(admitted_in) => None,
            State::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= config.half_open_max_calls() {
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.half_open_in_flight = 0;
                    Some(self.move_to(State::Closed))
                } else {
                    None
                }
            }
            // A straggler admitted before the circuit tripped.
            State::Open => None,
        }
    }

    /// Records a failure of a tracked kind.
    pub fn on_failure(&mut self, config: &CircuitConfig, now: Instant) -> Option<Transition> {
        match self.state {
            State::Closed => {
                self.last_failure = Some(now);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= config.failure_threshold() {
                    Some(self.move_to(State::Open))
                } else {
                    None
                }
            }
            State::HalfOpen => {
                self.last_failure = Some(now);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.half_open_in_flight = 0;
                Some(self.move_to(State::Open))
            }
            // Late results must not extend the open period.
            State::Open => None,
        }
    }

    /// Frees the probe slot of an admitted call that ended without a verdict.
    pub fn release_probe(&mut self, admitted_in: Option<u64>) {
        if self.state == State::HalfOpen && !self.is_stale(admitted_in) {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn reset(&mut self) -> Option<Transition> {
        let previous = self.state;
        let last_failure = self.last_failure;
        let last_success = self.last_success;
        let episode = self.episode;
        *self = Self::new();
        self.episode = episode;
        self.last_failure = last_failure;
        self.last_success = last_success;
        (previous != State::Closed).then_some(Transition {
            from: previous,
            to: State::Closed,
        })
    }

    fn move_to(&mut self, to: State) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }
}
