//! Async counting semaphore with FIFO fairness and cancellable waits.
//!
//! The semaphore is a monitor: its value and queue of suspended waiters are
//! only touched under one lock. A waiter that cannot take a permit right away
//! is queued as a *suspension* with its own wake channel; [`signal`] hands the
//! permit directly to the oldest suspension, so `value` stays at zero while
//! anyone is queued and newcomers cannot overtake.
//!
//! A suspension is removed by identity when its wait is cancelled or its
//! future dropped. If the permit had already been handed over, it is passed
//! on to the next waiter, so a cancelled wait never leaks or consumes a slot.
//!
//! [`signal`]: AsyncSemaphore::signal
//!
//! # Example
//!
//! ```rust
//! use paysub::AsyncSemaphore;
//!
//! # tokio_test::block_on(async {
//! let semaphore = AsyncSemaphore::new(1);
//!
//! semaphore.wait().await;
//! assert_eq!(semaphore.value(), 0);
//! assert!(!semaphore.try_wait());
//!
//! semaphore.signal();
//! assert_eq!(semaphore.value(), 1);
//! # });
//! ```

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cancellation::CancellationToken;

/// Counting semaphore whose waits suspend the task rather than the thread.
pub struct AsyncSemaphore {
    initial_value: usize,
    state: Mutex<SemaphoreState>,
}

struct SemaphoreState {
    value: usize,
    /// Newest at the front, oldest at the back.
    suspensions: VecDeque<Suspension>,
    next_id: u64,
}

/// A task parked in [`AsyncSemaphore::wait`], resumable exactly once.
struct Suspension {
    id: u64,
    resume: oneshot::Sender<()>,
}

/// Queue entry owned by a waiting future.
struct Suspended<'a> {
    semaphore: &'a AsyncSemaphore,
    id: u64,
    receiver: oneshot::Receiver<()>,
    resumed: bool,
}

impl AsyncSemaphore {
    /// Create a semaphore holding `value` permits.
    pub fn new(value: usize) -> Self {
        Self {
            initial_value: value,
            state: Mutex::new(SemaphoreState {
                value,
                suspensions: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    /// Number of permits the semaphore was created with.
    pub fn initial_value(&self) -> usize {
        self.initial_value
    }

    /// Number of permits currently available.
    pub fn value(&self) -> usize {
        self.state.lock().value
    }

    /// Number of suspended waiters.
    pub fn waiters(&self) -> usize {
        self.state.lock().suspensions.len()
    }

    /// Take a permit if one is available right now.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, suspending until one is signalled if none is
    /// available.
    pub async fn wait(&self) {
        if let Some(mut suspended) = self.acquire_or_suspend() {
            suspended.resumed().await;
        }
    }

    /// Take a permit unless `token` is cancelled first.
    ///
    /// If the token is already cancelled, fails without touching the
    /// semaphore. If it is cancelled while this call is suspended, the
    /// suspension is removed and the error from `on_cancel` is returned; the
    /// semaphore's value is left as if the call had never been made.
    pub async fn wait_unless_cancelled<E, F>(
        &self,
        token: &CancellationToken,
        on_cancel: F,
    ) -> Result<(), E>
    where
        F: FnOnce() -> E,
    {
        if token.is_cancelled() {
            return Err(on_cancel());
        }
        let Some(mut suspended) = self.acquire_or_suspend() else {
            return Ok(());
        };
        let cancelled = tokio::select! {
            biased;
            _ = suspended.resumed() => false,
            _ = token.cancelled() => true,
        };
        if cancelled {
            drop(suspended);
            tracing::trace!("semaphore wait cancelled");
            return Err(on_cancel());
        }
        Ok(())
    }

    /// Return a permit, resuming the oldest suspended waiter if there is one.
    ///
    /// Signalling more often than permits were taken is a caller bug; it is
    /// logged and the value stays capped at the initial value.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        self.release(&mut state);
    }

    fn release(&self, state: &mut SemaphoreState) {
        while let Some(suspension) = state.suspensions.pop_back() {
            if suspension.resume.send(()).is_ok() {
                return;
            }
        }
        if state.value >= self.initial_value {
            tracing::error!(
                initial_value = self.initial_value,
                "semaphore signalled beyond its initial value"
            );
            return;
        }
        state.value += 1;
    }

    fn acquire_or_suspend(&self) -> Option<Suspended<'_>> {
        let mut state = self.state.lock();
        if state.value > 0 {
            state.value -= 1;
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        let (resume, receiver) = oneshot::channel();
        state.suspensions.push_front(Suspension { id, resume });
        Some(Suspended {
            semaphore: self,
            id,
            receiver,
            resumed: false,
        })
    }
}

impl Suspended<'_> {
    async fn resumed(&mut self) {
        // The sender lives in the queue until `signal` fires it, and the queue
        // entry outlives this future, so the channel never closes unsent.
        let _ = (&mut self.receiver).await;
        self.resumed = true;
    }
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        if self.resumed {
            return;
        }
        let mut state = self.semaphore.state.lock();
        if let Some(index) = state.suspensions.iter().position(|s| s.id == self.id) {
            state.suspensions.remove(index);
        } else if self.receiver.try_recv().is_ok() {
            // Handed a permit we will not use.
            self.semaphore.release(&mut state);
        }
    }
}

impl Drop for AsyncSemaphore {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert!(
            self.state.get_mut().suspensions.is_empty(),
            "AsyncSemaphore dropped while tasks are suspended waiting for a signal"
        );
    }
}

impl std::fmt::Debug for AsyncSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncSemaphore")
            .field("initial_value", &self.initial_value)
            .field("value", &state.value)
            .field("waiters", &state.suspensions.len())
            .finish()
    }
}
