//! # Paysub
//!
//! > *Every call reports exactly once.*
//!
//! Async building blocks for a subscription and payment client: a retrying
//! API executor, a polling loop for server-side state that settles
//! eventually, and an async semaphore used to throttle interactive
//! authentication flows.
//!
//! ## Philosophy
//!
//! Each operation is a small **callback-driven state machine**:
//! - One lock guards the state; user code (transports, predicates,
//!   completions) never runs while it is held
//! - Timers and in-flight attempts are owned by the state they belong to and
//!   invalidated on every transition
//! - Cancellation, timeout and success race, and whichever lands first is the
//!   only result the caller ever sees
//!
//! ## Quick Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use paysub::prelude::*;
//! use paysub::testing::MockTransport;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MockTransport::new([
//!     Err(Failure::server(503)),
//!     Ok("sub_123".to_string()),
//! ]));
//! let executor = RetryingExecutor::new(
//!     transport,
//!     RetryPolicy::exponential(Duration::from_millis(1)).with_max_retries(3),
//! );
//!
//! let subscription = executor.execute(Request::post("/subscriptions")).await;
//! assert_eq!(subscription, Ok("sub_123".to_string()));
//! # });
//! ```
//!
//! All timing goes through tokio's clock, so tests can run with
//! `#[tokio::test(start_paused = true)]` and never actually sleep.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cancellation;
pub mod failure;
pub mod polling;
pub mod retry;
pub mod scheduler;
pub mod semaphore;
pub mod testing;
pub mod throttle;

// Re-exports
pub use cancellation::{Cancellable, CancellationToken, GroupCancellable};
pub use failure::{Completion, Failure, RETRYABLE_STATUS_CODES};
pub use polling::{poll, PollingConfig, PollingOperation};
pub use retry::{
    retry_while, Method, Request, RetryEvent, RetryPolicy, RetryStrategy, RetryingExecutor,
    RetryingOperation, Transport, DEFAULT_TIMEOUT, IDEMPOTENCY_KEY_HEADER,
};
pub use scheduler::{invoke, Scheduler, TimerAction, TokioScheduler};
pub use semaphore::AsyncSemaphore;
pub use throttle::{Throttled, DEFAULT_MIN_INTERVAL};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{Cancellable, CancellationToken};
    pub use crate::failure::Failure;
    pub use crate::polling::{poll, PollingConfig, PollingOperation};
    pub use crate::retry::{retry_while, Request, RetryPolicy, RetryingExecutor, Transport};
    pub use crate::semaphore::AsyncSemaphore;
    pub use crate::throttle::Throttled;
}
