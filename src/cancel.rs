//! Cooperative cancellation for the blocking points of a guarded call.
//!
//! A [`CancelToken`] is shared between the caller and the retry executor and
//! timeout guard. The executor checks it between attempts and wakes from its
//! backoff sleep as soon as it is cancelled; the timeout guard stops waiting
//! for the operation. An optional deadline acts as an automatic cancel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TokenState {
    cancelled: bool,
    deadline: Option<Instant>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    changed: Condvar,
    /// Async waiters; the condvar serves blocking ones.
    #[cfg(feature = "async")]
    async_token: tokio_util::sync::CancellationToken,
}

/// Outcome of [`CancelToken::wait_for`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wait<R> {
    Ready(R),
    TimedOut,
    Cancelled,
}

/// A cloneable cancellation signal with an optional deadline.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CancelToken")
            .field("cancelled", &state.cancelled)
            .field("deadline", &state.deadline)
            .finish()
    }
}

impl CancelToken {
    /// Creates a token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a token that cancels itself at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    /// Creates a token that cancels itself after `budget` from now.
    pub fn with_budget(budget: Duration) -> Self {
        Self::build(Instant::now().checked_add(budget))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState {
                    cancelled: false,
                    deadline,
                }),
                changed: Condvar::new(),
                #[cfg(feature = "async")]
                async_token: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// Cancels every wait on this token, now and in the future.
    pub fn cancel(&self) {
        self.inner.state.lock().cancelled = true;
        self.inner.changed.notify_all();
        #[cfg(feature = "async")]
        self.inner.async_token.cancel();
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        let state = self.inner.state.lock();
        Self::expired(&state, Instant::now())
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.state.lock().deadline
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn expired(state: &TokenState, now: Instant) -> bool {
        state.cancelled || state.deadline.is_some_and(|d| now >= d)
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns false if the token was cancelled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.wait_for(duration, || None::<()>) {
            Wait::Cancelled => false,
            Wait::TimedOut | Wait::Ready(()) => true,
        }
    }

    /// Wakes every thread blocked in [`wait_for`](Self::wait_for) so it
    /// re-polls.
    pub(crate) fn wake(&self) {
        // Taking the lock orders this notify after the waiter's poll.
        let _state = self.inner.state.lock();
        self.inner.changed.notify_all();
    }

    /// Blocks until `poll` yields a value, `timeout` elapses, or the token is
    /// cancelled, whichever comes first.
    ///
    /// `poll` runs with the token's lock held; whoever makes it ready must
    /// call [`wake`](Self::wake) afterwards.
    pub(crate) fn wait_for<R>(&self, timeout: Duration, mut poll: impl FnMut() -> Option<R>) -> Wait<R> {
        let until = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = poll() {
                return Wait::Ready(value);
            }
            let now = Instant::now();
            if Self::expired(&state, now) {
                return Wait::Cancelled;
            }
            if until.is_some_and(|u| now >= u) {
                return Wait::TimedOut;
            }
            let wake_at = match (until, state.deadline) {
                (Some(u), Some(d)) => Some(u.min(d)),
                (u, d) => u.or(d),
            };
            match wake_at {
                Some(at) => {
                    self.inner.changed.wait_until(&mut state, at);
                }
                None => self.inner.changed.wait(&mut state),
            }
        }
    }

    /// Resolves once the token is cancelled or its deadline passes.
    #[cfg(feature = "async")]
    pub async fn cancelled(&self) {
        let cancelled = self.inner.async_token.cancelled();
        match self.deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = cancelled => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => cancelled.await,
        }
    }
}
