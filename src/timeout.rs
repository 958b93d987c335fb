//! Bounding how long a single attempt may take.
//!
//! # Non-preemptive timeouts
//!
//! A blocking closure cannot be interrupted from the outside. The synchronous
//! [`TimeoutGuard::run`] therefore moves the operation to a detached worker
//! thread and only stops *waiting* for it: when the limit passes, the caller
//! gets [`FailoverError::Timeout`] while the worker keeps running until the
//! operation returns on its own, and its late result is dropped. Side effects
//! of an abandoned call (a request already sent, tokens already billed) are
//! not suppressed. Operations should carry their own socket or client
//! timeouts so abandoned workers do not pile up under sustained slowness.
//!
//! The async [`TimeoutGuard::run_async`] is cooperative instead: the future
//! is dropped at the deadline, which cancels it at its next await point.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancel::{CancelToken, Wait};
use crate::error::{FailoverError, FailoverResult};

enum Slot<R> {
    Pending,
    Done(R),
    Panicked(Box<dyn std::any::Any + Send + 'static>),
}

/// Bounds the execution time of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    limit: Duration,
}

impl TimeoutGuard {
    /// Creates a guard with the given limit.
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// The time budget.
    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Runs `f` on a worker thread and waits at most the limit for it.
    ///
    /// See the module docs: a timed-out `f` keeps running in the background.
    /// A panic inside `f` is resumed on the calling thread.
    /// If no worker thread can be started the call fails with
    /// [`FailoverError::Spawn`] without running `f`.
    pub fn run<T, E, F>(&self, f: F) -> FailoverResult<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run_cancellable(&CancelToken::new(), f)
    }

    /// Like [`run`](Self::run), but also stops waiting when `token` is
    /// cancelled, returning [`FailoverError::Cancelled`].
    pub fn run_cancellable<T, E, F>(&self, token: &CancelToken, f: F) -> FailoverResult<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if token.is_cancelled() {
            return Err(FailoverError::Cancelled);
        }

        let slot = Arc::new(Mutex::new(Slot::Pending));
        let worker_slot = Arc::clone(&slot);
        let worker_token = token.clone();

        thread::Builder::new()
            .name("failover-timeout".into())
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(result) => Slot::Done(result),
                    Err(payload) => Slot::Panicked(payload),
                };
                *worker_slot.lock() = outcome;
                worker_token.wake();
            })
            .map_err(spawn_failed)?;

        let waited = token.wait_for(self.limit, || {
            let mut slot = slot.lock();
            match std::mem::replace(&mut *slot, Slot::Pending) {
                Slot::Pending => None,
                finished => Some(finished),
            }
        });

        match waited {
            Wait::Ready(Slot::Done(result)) => result.map_err(FailoverError::Operation),
            Wait::Ready(Slot::Panicked(payload)) => panic::resume_unwind(payload),
            Wait::Ready(Slot::Pending) | Wait::TimedOut => {
                tracing::debug!(limit_ms = self.limit.as_millis() as u64, "attempt timed out");
                Err(FailoverError::Timeout(self.limit))
            }
            Wait::Cancelled => Err(FailoverError::Cancelled),
        }
    }

    /// Awaits `fut` for at most the limit, dropping it on timeout or when
    /// `token` is cancelled.
    #[cfg(feature = "async")]
    pub async fn run_async<T, E, Fut>(&self, token: &CancelToken, fut: Fut) -> FailoverResult<T, E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        tokio::select! {
            result = tokio::time::timeout(self.limit, fut) => match result {
                Ok(outcome) => outcome.map_err(FailoverError::Operation),
                Err(_) => {
                    tracing::debug!(limit_ms = self.limit.as_millis() as u64, "attempt timed out");
                    Err(FailoverError::Timeout(self.limit))
                }
            },
            _ = token.cancelled() => Err(FailoverError::Cancelled),
        }
    }
}

fn spawn_failed<E>(err: std::io::Error) -> FailoverError<E> {
    tracing::error!(error = %err, "could not spawn timeout worker");
    FailoverError::Spawn(err)
}
