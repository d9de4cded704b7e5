//! Retrying API executor.
//!
//! Split the same way as the rest of the crate:
//!
//! - **Policy**: [`RetryPolicy`] is plain data describing how many retries are
//!   allowed and how long to wait before each. No side effects.
//! - **Request**: [`Request`] plus the [`Transport`] seam that actually sends
//!   it. Unsafe methods carry an idempotency key that survives every retry.
//! - **Executor**: [`RetryingExecutor`] drives a [`RetryingOperation`] per call,
//!   applying the policy, an overall deadline and cancellation.
//! - **Conditional**: [`retry_while`] re-runs any async operation while its
//!   result, success or failure, is not settled yet.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use paysub::{Failure, Request, RetryPolicy, RetryingExecutor};
//! use paysub::testing::MockTransport;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MockTransport::new([
//!     Err(Failure::server(503)),
//!     Err(Failure::server(503)),
//!     Ok(()),
//! ]));
//! let policy = RetryPolicy::exponential(Duration::from_millis(1)).with_max_retries(2);
//! let executor = RetryingExecutor::new(transport.clone(), policy);
//!
//! executor.execute(Request::delete("/subscriptions/sub_1")).await.unwrap();
//!
//! // Three attempts, all with the same idempotency key.
//! let keys: Vec<_> = transport
//!     .requests()
//!     .iter()
//!     .map(|r| r.idempotency_key().map(str::to_owned))
//!     .collect();
//! assert_eq!(keys.len(), 3);
//! assert!(keys[0].is_some());
//! assert!(keys.iter().all(|k| *k == keys[0]));
//! # });
//! ```
//!
//! # Retry Strategies
//!
//! - **Constant**: Fixed delay between retries
//! - **Linear**: Delay increases linearly (100ms, 200ms, 300ms, ...)
//! - **Exponential**: Delay multiplies each retry (100ms, 200ms, 400ms, ...)
//! - **Fibonacci**: Delay follows Fibonacci sequence

mod conditional;
mod executor;
mod policy;
mod request;

pub use conditional::retry_while;
pub use executor::{RetryingExecutor, RetryingOperation, DEFAULT_TIMEOUT};
pub use policy::{RetryEvent, RetryPolicy, RetryStrategy};
pub use request::{Method, Request, Transport, IDEMPOTENCY_KEY_HEADER};

#[cfg(test)]
mod tests;
