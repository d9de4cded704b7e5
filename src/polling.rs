//! Polling until server-side state settles.
//!
//! A [`PollingOperation`] repeatedly runs a caller-supplied action until the
//! `should_continue` predicate says stop or the overall timeout elapses,
//! waiting a fixed delay between attempts. The timeout is armed once in
//! [`start`](PollingOperation::start) and shared by every attempt, so it
//! measures total elapsed time.
//!
//! ```text
//! Idle -> Executing -> { Waiting <-> Executing }* -> Completed
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use paysub::{poll, Failure, PollingConfig};
//!
//! # tokio_test::block_on(async {
//! let checks = Arc::new(AtomicU32::new(0));
//! let counter = checks.clone();
//!
//! let status = poll(
//!     PollingConfig::new(Duration::from_secs(5), Duration::from_millis(1)),
//!     move || {
//!         let n = counter.fetch_add(1, Ordering::SeqCst);
//!         async move { Ok::<_, Failure>(if n < 2 { "pending" } else { "captured" }) }
//!     },
//!     |result| matches!(result, Ok("pending")),
//! )
//! .await;
//!
//! assert_eq!(status, Ok("captured"));
//! assert_eq!(checks.load(Ordering::SeqCst), 3);
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cancellation::{CancelOnDrop, Cancellable, CancellationToken, GroupCancellable};
use crate::failure::{Completion, Failure};
use crate::scheduler::{invoke, Scheduler, TokioScheduler};

/// Timing of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollingConfig {
    /// Overall deadline, measured from `start`.
    pub timeout: Duration,
    /// Pause between the end of one attempt and the start of the next.
    pub delay: Duration,
}

impl PollingConfig {
    /// Create a configuration.
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        Self { timeout, delay }
    }
}

type Action<T> = Arc<dyn Fn(Completion<T>) -> Box<dyn Cancellable> + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&Result<T, Failure>) -> bool + Send + Sync>;

/// Callback-driven polling state machine.
///
/// Cloning yields another handle to the same operation.
pub struct PollingOperation<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    config: PollingConfig,
    execute: Action<T>,
    should_continue: Predicate<T>,
    scheduler: TokioScheduler,
    state: Mutex<State>,
    completion: Mutex<Option<Completion<T>>>,
}

enum State {
    Idle,
    Executing {
        timeout_timer: CancellationToken,
        cancellable: Arc<GroupCancellable>,
        attempt: u32,
    },
    Waiting {
        timeout_timer: CancellationToken,
        delay_timer: CancellationToken,
        attempt: u32,
    },
    Completed,
}

impl<T: Send + 'static> PollingOperation<T> {
    /// Create an idle operation.
    ///
    /// `execute` starts one attempt and must eventually call the completion
    /// it is given (possibly before returning); the value it returns cancels
    /// that attempt. `should_continue` returns true while the result is not
    /// final yet. `completion` receives the terminal result exactly once.
    pub fn new<E, C, P, D>(
        config: PollingConfig,
        execute: E,
        should_continue: P,
        completion: D,
    ) -> Self
    where
        E: Fn(Completion<T>) -> C + Send + Sync + 'static,
        C: Cancellable + 'static,
        P: Fn(&Result<T, Failure>) -> bool + Send + Sync + 'static,
        D: FnOnce(Result<T, Failure>) + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config,
                execute: Arc::new(move |completion: Completion<T>| -> Box<dyn Cancellable> {
                    Box::new(execute(completion))
                }),
                should_continue: Arc::new(should_continue),
                scheduler: TokioScheduler,
                state: Mutex::new(State::Idle),
                completion: Mutex::new(Some(Box::new(completion))),
            }),
        }
    }

    /// Arm the timeout and run the first attempt. Does nothing unless idle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, since the timers are
    /// spawned onto it.
    pub fn start(&self) {
        let inner = &self.inner;
        let cancellable = {
            let mut state = inner.state.lock();
            if !matches!(*state, State::Idle) {
                return;
            }
            let timeout_timer = {
                let this = inner.clone();
                inner
                    .scheduler
                    .after(inner.config.timeout, Box::new(move || this.time_out()))
            };
            let cancellable = Arc::new(GroupCancellable::new());
            *state = State::Executing {
                timeout_timer,
                cancellable: cancellable.clone(),
                attempt: 0,
            };
            cancellable
        };
        tracing::debug!(timeout_ms = inner.config.timeout.as_millis() as u64, "polling started");
        inner.run_attempt(&cancellable, 0);
    }

    /// Returns true once the operation has reported its result.
    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Completed)
    }
}

impl<T: Send + 'static> Cancellable for PollingOperation<T> {
    /// Stop polling and report [`Failure::Cancelled`]. Has no effect before
    /// `start` or after completion.
    fn cancel(&self) {
        self.inner.finish(Err(Failure::Cancelled));
    }
}

impl<T> Clone for PollingOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for PollingOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Idle => "idle",
            State::Executing { .. } => "executing",
            State::Waiting { .. } => "waiting",
            State::Completed => "completed",
        };
        f.debug_struct("PollingOperation")
            .field("config", &self.inner.config)
            .field("state", &state)
            .finish()
    }
}

impl<T: Send + 'static> Inner<T> {
    fn run_attempt(self: &Arc<Self>, cancellable: &GroupCancellable, attempt: u32) {
        let completion: Completion<T> = {
            let inner = self.clone();
            Box::new(move |result| inner.attempt_completed(attempt, result))
        };
        // The attempt may already have completed, and the whole operation
        // finished, by the time `execute` returns; the group then cancels the
        // returned token on the spot.
        cancellable.add((self.execute)(completion));
    }

    fn is_current(&self, attempt: u32) -> bool {
        matches!(
            *self.state.lock(),
            State::Executing { attempt: current, .. } if current == attempt
        )
    }

    fn attempt_completed(self: &Arc<Self>, attempt: u32, result: Result<T, Failure>) {
        if !self.is_current(attempt) {
            return;
        }
        if !(self.should_continue)(&result) {
            tracing::debug!(attempt, "polling reached a final result");
            self.finish(result);
            return;
        }

        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Completed) {
            State::Executing {
                timeout_timer,
                attempt: current,
                ..
            } if current == attempt => {
                let delay_timer = {
                    let inner = self.clone();
                    self.scheduler.after(
                        self.config.delay,
                        Box::new(move || inner.next_attempt()),
                    )
                };
                tracing::trace!(
                    attempt,
                    delay_ms = self.config.delay.as_millis() as u64,
                    "polling again after delay"
                );
                *state = State::Waiting {
                    timeout_timer,
                    delay_timer,
                    attempt,
                };
            }
            // Cancelled or timed out while the predicate was running.
            other => *state = other,
        }
    }

    fn next_attempt(self: &Arc<Self>) {
        let (cancellable, attempt) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Completed) {
                State::Waiting {
                    timeout_timer,
                    attempt,
                    ..
                } => {
                    let cancellable = Arc::new(GroupCancellable::new());
                    let attempt = attempt + 1;
                    *state = State::Executing {
                        timeout_timer,
                        cancellable: cancellable.clone(),
                        attempt,
                    };
                    (cancellable, attempt)
                }
                other => {
                    *state = other;
                    return;
                }
            }
        };
        self.run_attempt(&cancellable, attempt);
    }

    fn time_out(&self) {
        if self.finish(Err(Failure::Timeout)) {
            tracing::warn!(
                timeout_ms = self.config.timeout.as_millis() as u64,
                "polling timed out"
            );
        }
    }

    /// Report `result` unless already finished. Returns false if polling was
    /// not running.
    fn finish(&self, result: Result<T, Failure>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Completed) {
                running @ (State::Executing { .. } | State::Waiting { .. }) => running,
                other => {
                    *state = other;
                    return false;
                }
            }
        };

        match previous {
            State::Executing {
                timeout_timer,
                cancellable,
                ..
            } => {
                timeout_timer.cancel();
                cancellable.cancel();
            }
            State::Waiting {
                timeout_timer,
                delay_timer,
                ..
            } => {
                timeout_timer.cancel();
                delay_timer.cancel();
            }
            State::Idle | State::Completed => {}
        }

        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            completion(result);
        }
        true
    }
}

/// Poll an async `action` until `should_continue` returns false, and return
/// that final result.
///
/// Fails with [`Failure::Timeout`] once `config.timeout` has elapsed.
/// Dropping the returned future cancels polling.
///
/// # Panics
///
/// Panics if polled outside a tokio runtime.
pub async fn poll<T, F, Fut, P>(
    config: PollingConfig,
    action: F,
    should_continue: P,
) -> Result<T, Failure>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    P: Fn(&Result<T, Failure>) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let operation = PollingOperation::new(
        config,
        move |completion| invoke(action(), completion),
        should_continue,
        move |result| {
            let _ = tx.send(result);
        },
    );
    let guard = CancelOnDrop(operation);
    guard.0.start();
    rx.await
        .unwrap_or_else(|_| Err(Failure::Internal("polling dropped its completion".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    fn recorder<T: Send + 'static>() -> (
        impl FnOnce(Result<T, Failure>) + Send + 'static,
        Arc<Mutex<Vec<Result<T, Failure>>>>,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (move |result| sink.lock().push(result), results)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_when_not_started_does_nothing() {
        let touched = Arc::new(AtomicU32::new(0));
        let (a, b, c) = (touched.clone(), touched.clone(), touched.clone());
        let sut = PollingOperation::<()>::new(
            PollingConfig::new(Duration::ZERO, Duration::ZERO),
            move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                GroupCancellable::new()
            },
            move |_| {
                b.fetch_add(1, Ordering::SeqCst);
                true
            },
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        sut.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(touched.load(Ordering::SeqCst), 0);
        assert!(!sut.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_runs_one_loop() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let (completion, results) = recorder::<u32>();
        let sut = PollingOperation::new(
            PollingConfig::new(Duration::from_secs(1), Duration::from_secs(5)),
            move |completion: Completion<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                completion(Ok(1));
                CancellationToken::new()
            },
            |_| false,
            completion,
        );

        sut.start();
        sut.start();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*results.lock(), vec![Ok(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_again_until_predicate_stops() {
        let stash: Arc<Mutex<Vec<Completion<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let keep = stash.clone();
        let (completion, results) = recorder::<u32>();
        let sut = PollingOperation::new(
            PollingConfig::new(Duration::from_secs(10), Duration::from_millis(100)),
            move |completion: Completion<u32>| {
                keep.lock().push(completion);
                CancellationToken::new()
            },
            |result| matches!(result, Ok(0)),
            completion,
        );
        sut.start();

        // First attempt says "keep going", then the second attempt starts.
        let first = stash.lock().remove(0);
        first(Ok(0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(stash.lock().len(), 1);

        let second = stash.lock().remove(0);
        second(Ok(7));

        assert_eq!(*results.lock(), vec![Ok(7)]);
    }

    #[test]
    #[should_panic]
    fn test_start_outside_runtime_panics() {
        let sut = PollingOperation::<u32>::new(
            PollingConfig::new(Duration::from_secs(1), Duration::ZERO),
            |_| CancellationToken::new(),
            |_| false,
            |_| {},
        );
        sut.start();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timeout_after_final_result_is_silent() {
        let (completion, results) = recorder::<u32>();
        let sut = PollingOperation::new(
            PollingConfig::new(Duration::from_secs(1), Duration::ZERO),
            |completion: Completion<u32>| {
                completion(Ok(3));
                CancellationToken::new()
            },
            |_| false,
            completion,
        );
        sut.start();

        // The timeout firing in the same instant as the final result.
        sut.inner.time_out();

        assert_eq!(*results.lock(), vec![Ok(3)]);
        assert!(!logs_contain("polling timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_runs_without_locks_held() {
        let slot: Arc<Mutex<Option<PollingOperation<u32>>>> = Arc::new(Mutex::new(None));
        let unlocked = Arc::new(Mutex::new(Vec::new()));
        let sut = PollingOperation::new(
            PollingConfig::new(Duration::from_secs(1), Duration::ZERO),
            |completion: Completion<u32>| {
                completion(Ok(1));
                CancellationToken::new()
            },
            |_| false,
            {
                let slot = slot.clone();
                let unlocked = unlocked.clone();
                move |_: Result<u32, Failure>| {
                    if let Some(operation) = slot.lock().as_ref() {
                        let inner = &operation.inner;
                        unlocked.lock().push(
                            inner.state.try_lock().is_some()
                                && inner.completion.try_lock().is_some(),
                        );
                        operation.cancel();
                    }
                }
            },
        );
        *slot.lock() = Some(sut.clone());

        sut.start();

        assert_eq!(*unlocked.lock(), vec![true]);
        assert!(sut.is_completed());
        slot.lock().take();
    }
}
