//! Timer and task facility used by the state machines.
//!
//! State machines never sleep themselves; they ask a [`Scheduler`] to run an
//! action after a delay and keep the returned [`CancellationToken`] so the
//! timer can be invalidated on a state transition. The default
//! [`TokioScheduler`] runs on tokio's monotonic clock, which also means tests
//! can drive it with `tokio::time::pause()`. Spawned work stays inside the
//! span that was current when it was scheduled, so the log lines of one
//! operation keep the caller's context.

use std::future::Future;
use std::time::Duration;

use tracing::Instrument;

use crate::cancellation::CancellationToken;
use crate::failure::Failure;

/// A one-shot action scheduled on a timer.
pub type TimerAction = Box<dyn FnOnce() + Send + 'static>;

/// Schedules delayed actions.
///
/// Implementations must never invoke `action` synchronously from within
/// [`after`](Scheduler::after): callers hold their state lock while arming
/// timers.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `action` once `delay` has elapsed, unless the returned token is
    /// cancelled first.
    fn after(&self, delay: Duration, action: TimerAction) -> CancellationToken;
}

/// [`Scheduler`] backed by `tokio::time::sleep` on the ambient runtime.
///
/// Must be used from within a tokio runtime context.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, action: TimerAction) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let timer = async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => action(),
            }
        };
        tokio::spawn(timer.in_current_span());
        token
    }
}

/// Run an async operation and hand its result to a completion callback.
///
/// Bridges `async` code to the callback contract used by
/// [`PollingOperation`](crate::PollingOperation). The returned token cancels
/// the spawned task; once cancelled, `completion` is never called.
///
/// # Example
///
/// ```rust
/// use paysub::{invoke, Failure};
///
/// # tokio_test::block_on(async {
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// let _token = invoke(async { Ok::<_, Failure>(7) }, move |result| {
///     let _ = tx.send(result);
/// });
/// assert_eq!(rx.await.unwrap(), Ok(7));
/// # });
/// ```
pub fn invoke<T, Fut, C>(operation: Fut, completion: C) -> CancellationToken
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    C: FnOnce(Result<T, Failure>) + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let task = async move {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {}
            result = operation => completion(result),
        }
    };
    tokio::spawn(task.in_current_span());
    token
}
