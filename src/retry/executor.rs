//! Retrying request executor.
//!
//! [`RetryingExecutor`] holds the configuration shared by every call made
//! through one transport. Each logical call is a [`RetryingOperation`]: a
//! small state machine that dispatches the request, waits out the backoff
//! after a retryable failure, dispatches again, and finally reports exactly
//! one result.
//!
//! ```text
//! Idle -> Executing -> { Waiting <-> Executing }* -> Completed
//! ```
//!
//! A single overall deadline (one hour unless configured) bounds the whole
//! call independently of the retry budget.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cancellation::{CancelOnDrop, Cancellable, CancellationToken};
use crate::failure::{Completion, Failure};
use crate::retry::policy::{RetryEvent, RetryPolicy};
use crate::retry::request::{Request, Transport};
use crate::scheduler::{invoke, Scheduler, TokioScheduler};

/// Overall deadline applied to a call when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

type RetryPredicate = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;
type RetryObserver = Arc<dyn Fn(&RetryEvent<'_>) + Send + Sync>;

/// Executes requests against a [`Transport`], retrying transient failures.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use paysub::{Failure, Request, RetryPolicy, RetryingExecutor};
/// use paysub::testing::MockTransport;
///
/// # tokio_test::block_on(async {
/// let transport = Arc::new(MockTransport::new([
///     Err(Failure::NetworkUnreachable),
///     Ok("iv_123".to_string()),
/// ]));
/// let executor = RetryingExecutor::new(
///     transport.clone(),
///     RetryPolicy::constant(Duration::from_millis(1)).with_max_retries(2),
/// );
///
/// let invoice = executor.execute(Request::post("/invoices")).await;
/// assert_eq!(invoice, Ok("iv_123".to_string()));
/// assert_eq!(transport.calls(), 2);
/// # });
/// ```
pub struct RetryingExecutor<T: Transport> {
    transport: Arc<T>,
    policy: RetryPolicy,
    should_retry: RetryPredicate,
    timeout: Duration,
    timeout_failure: Failure,
    scheduler: Arc<dyn Scheduler>,
    on_retry: Option<RetryObserver>,
}

impl<T: Transport> RetryingExecutor<T> {
    /// Create an executor using [`Failure::is_retryable`] as the retry
    /// predicate and [`DEFAULT_TIMEOUT`] as the overall deadline.
    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            should_retry: Arc::new(Failure::is_retryable),
            timeout: DEFAULT_TIMEOUT,
            timeout_failure: Failure::Timeout,
            scheduler: Arc::new(TokioScheduler),
            on_retry: None,
        }
    }

    /// Replace the predicate deciding which failures are retried.
    pub fn with_should_retry<P>(mut self, should_retry: P) -> Self
    where
        P: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(should_retry);
        self
    }

    /// Set the overall deadline and the failure reported when it elapses.
    pub fn with_timeout(mut self, timeout: Duration, failure: Failure) -> Self {
        self.timeout = timeout;
        self.timeout_failure = failure;
        self
    }

    /// Use a custom timer facility.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Observe every failed attempt, including the last one.
    pub fn with_on_retry<H>(mut self, on_retry: H) -> Self
    where
        H: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(on_retry));
        self
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Build an operation for one logical call. Nothing is sent until
    /// [`RetryingOperation::start`] is called.
    pub fn operation<C>(&self, request: Request, completion: C) -> RetryingOperation<T>
    where
        C: FnOnce(Result<T::Response, Failure>) + Send + 'static,
    {
        RetryingOperation {
            inner: Arc::new(Operation {
                executor: self.clone(),
                state: Mutex::new(State::Idle { request }),
                completion: Mutex::new(Some(Box::new(completion))),
            }),
        }
    }

    /// Execute `request` and wait for its final result.
    ///
    /// Dropping the returned future cancels the call.
    ///
    /// # Panics
    ///
    /// With the default scheduler, panics if polled outside a tokio runtime.
    pub async fn execute(&self, request: Request) -> Result<T::Response, Failure> {
        let (tx, rx) = oneshot::channel();
        let operation = self.operation(request, move |result| {
            let _ = tx.send(result);
        });
        let guard = CancelOnDrop(operation);
        guard.0.start();
        rx.await
            .unwrap_or_else(|_| Err(Failure::Internal("operation dropped its completion".into())))
    }
}

impl<T: Transport> Clone for RetryingExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            policy: self.policy.clone(),
            should_retry: self.should_retry.clone(),
            timeout: self.timeout,
            timeout_failure: self.timeout_failure.clone(),
            scheduler: self.scheduler.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for RetryingExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingExecutor")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .field("timeout_failure", &self.timeout_failure)
            .finish_non_exhaustive()
    }
}

/// One logical call driven by a [`RetryingExecutor`].
///
/// Cloning yields another handle to the same call.
pub struct RetryingOperation<T: Transport> {
    inner: Arc<Operation<T>>,
}

struct Operation<T: Transport> {
    executor: RetryingExecutor<T>,
    state: Mutex<State>,
    completion: Mutex<Option<Completion<T::Response>>>,
}

/// Per-call data carried across the running states.
struct Call {
    request: Request,
    deadline: CancellationToken,
    started_at: Instant,
}

enum State {
    Idle {
        request: Request,
    },
    Executing {
        call: Call,
        token: CancellationToken,
        attempt: u32,
    },
    Waiting {
        call: Call,
        timer: CancellationToken,
        attempt: u32,
    },
    Completed,
}

impl<T: Transport> RetryingOperation<T> {
    /// Dispatch the first attempt and arm the overall deadline.
    ///
    /// Does nothing unless the operation is idle.
    ///
    /// # Panics
    ///
    /// With the default scheduler, panics if called outside a tokio runtime,
    /// since the attempt and the deadline are spawned onto it.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let request = match std::mem::replace(&mut *state, State::Completed) {
            State::Idle { mut request } => {
                request.ensure_idempotency_key();
                request
            }
            other => {
                *state = other;
                return;
            }
        };

        tracing::debug!(
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            "starting request"
        );

        let deadline = {
            let this = inner.clone();
            inner
                .executor
                .scheduler
                .after(inner.executor.timeout, Box::new(move || this.time_out()))
        };
        let token = inner.dispatch(&request, 0);
        *state = State::Executing {
            call: Call {
                request,
                deadline,
                started_at: Instant::now(),
            },
            token,
            attempt: 0,
        };
    }

    /// Returns true once the operation has reported its result.
    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Completed)
    }
}

impl<T: Transport> Cancellable for RetryingOperation<T> {
    /// Stop the call and report [`Failure::Cancelled`]. Has no effect before
    /// `start` or after completion.
    fn cancel(&self) {
        self.inner.finish(Err(Failure::Cancelled));
    }
}

impl<T: Transport> Clone for RetryingOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for RetryingOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Idle { .. } => "idle",
            State::Executing { .. } => "executing",
            State::Waiting { .. } => "waiting",
            State::Completed => "completed",
        };
        f.debug_struct("RetryingOperation")
            .field("state", &state)
            .finish()
    }
}

impl<T: Transport> Operation<T> {
    /// Send one attempt. The returned token suppresses its result.
    fn dispatch(self: &Arc<Self>, request: &Request, attempt: u32) -> CancellationToken {
        tracing::trace!(request_id = %request.id, attempt, "dispatching request");
        let transport = self.executor.transport.clone();
        let request = request.clone();
        let inner = self.clone();
        invoke(
            async move { transport.execute(request).await },
            move |result| inner.attempt_completed(result),
        )
    }

    fn attempt_completed(self: &Arc<Self>, result: Result<T::Response, Failure>) {
        let executor = &self.executor;
        let retryable = match &result {
            Ok(_) => false,
            Err(failure) => (executor.should_retry)(failure),
        };

        let mut state = self.state.lock();
        let (call, attempt) = match std::mem::replace(&mut *state, State::Completed) {
            State::Executing { call, attempt, .. } => (call, attempt),
            other => {
                // Late result after cancellation or timeout.
                *state = other;
                return;
            }
        };

        let failure = match result {
            Ok(value) => {
                drop(state);
                tracing::debug!(request_id = %call.request.id, attempt, "request succeeded");
                call.deadline.cancel();
                self.complete(Ok(value));
                return;
            }
            Err(failure) => failure,
        };

        let next_delay = if retryable {
            executor.policy.delay_for_attempt(attempt)
        } else {
            None
        };
        let request_id = call.request.id.clone();
        let elapsed = call.started_at.elapsed();

        let finished = match next_delay {
            Some(delay) => {
                let timer = {
                    let inner = self.clone();
                    executor
                        .scheduler
                        .after(delay, Box::new(move || inner.retry()))
                };
                *state = State::Waiting {
                    call,
                    timer,
                    attempt,
                };
                None
            }
            None => Some(call),
        };
        drop(state);

        if let Some(on_retry) = &executor.on_retry {
            on_retry(&RetryEvent {
                attempt: attempt + 1,
                failure: &failure,
                next_delay,
                elapsed,
            });
        }

        match finished {
            None => {
                tracing::warn!(
                    request_id = %request_id,
                    attempt,
                    delay_ms = next_delay.unwrap_or_default().as_millis() as u64,
                    error = %failure,
                    "request failed, retrying"
                );
            }
            Some(call) => {
                tracing::debug!(request_id = %request_id, attempt, error = %failure, "request failed");
                call.deadline.cancel();
                self.complete(Err(failure));
            }
        }
    }

    fn retry(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Completed) {
            State::Waiting { call, attempt, .. } => {
                let attempt = attempt + 1;
                tracing::debug!(request_id = %call.request.id, attempt, "retrying request");
                let token = self.dispatch(&call.request, attempt);
                *state = State::Executing {
                    call,
                    token,
                    attempt,
                };
            }
            other => *state = other,
        }
    }

    fn time_out(&self) {
        if self.finish(Err(self.executor.timeout_failure.clone())) {
            tracing::warn!(
                timeout_ms = self.executor.timeout.as_millis() as u64,
                "request deadline elapsed"
            );
        }
    }

    /// Move any running state to `Completed`, invalidating its timers and
    /// in-flight attempt, and report `result`. Returns false if the call was
    /// not running.
    fn finish(&self, result: Result<T::Response, Failure>) -> bool {
        let mut state = self.state.lock();
        let previous = match std::mem::replace(&mut *state, State::Completed) {
            running @ (State::Executing { .. } | State::Waiting { .. }) => running,
            other => {
                *state = other;
                return false;
            }
        };
        drop(state);

        match previous {
            State::Executing { call, token, .. } => {
                token.cancel();
                call.deadline.cancel();
            }
            State::Waiting { call, timer, .. } => {
                timer.cancel();
                call.deadline.cancel();
            }
            State::Idle { .. } | State::Completed => {}
        }
        self.complete(result);
        true
    }

    fn complete(&self, result: Result<T::Response, Failure>) {
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            completion(result);
        }
    }
}
