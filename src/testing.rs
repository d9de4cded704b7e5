//! Test doubles for code built on the executor and polling operations.
//!
//! # Examples
//!
//! ## Scripted transport
//!
//! ```rust
//! use paysub::{Failure, Request, Transport};
//! use paysub::testing::MockTransport;
//!
//! # tokio_test::block_on(async {
//! let transport = MockTransport::new([Err(Failure::server(503)), Ok(42)]);
//!
//! assert_eq!(transport.execute(Request::get("/a")).await, Err(Failure::server(503)));
//! assert_eq!(transport.execute(Request::get("/b")).await, Ok(42));
//! assert_eq!(transport.calls(), 2);
//! # });
//! ```
//!
//! ## Recording completions
//!
//! ```rust
//! use paysub::Failure;
//! use paysub::testing::CompletionRecorder;
//! use paysub::assert_failed;
//!
//! let recorder = CompletionRecorder::<u32>::new();
//! let completion = recorder.completion();
//! completion(Err(Failure::Cancelled));
//!
//! assert_eq!(recorder.count(), 1);
//! assert_failed!(recorder.last().unwrap(), Failure::Cancelled);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::failure::{Completion, Failure};
use crate::retry::{Request, Transport};

/// A [`Transport`] that replays a fixed script of results.
///
/// Each call consumes the next scripted result. Once the script runs out,
/// calls fail with [`Failure::Internal`]. Every request is recorded, so tests
/// can check headers such as the idempotency key across attempts.
#[derive(Debug)]
pub struct MockTransport<V> {
    script: Mutex<VecDeque<Result<V, Failure>>>,
    requests: Mutex<Vec<Request>>,
    latency: Option<Duration>,
}

impl<V> MockTransport<V> {
    /// Create a transport returning `script` in order.
    pub fn new(script: impl IntoIterator<Item = Result<V, Failure>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Snapshot of every request received, oldest first.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Scripted results not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl<V: Send + 'static> Transport for MockTransport<V> {
    type Response = V;

    async fn execute(&self, request: Request) -> Result<V, Failure> {
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        next.unwrap_or_else(|| Err(Failure::Internal("mock transport script exhausted".into())))
    }
}

/// Collects every result delivered to the completions it hands out.
///
/// Used to check that an operation reports exactly once.
#[derive(Debug)]
pub struct CompletionRecorder<T> {
    results: Arc<Mutex<Vec<Result<T, Failure>>>>,
}

impl<T: Send + 'static> CompletionRecorder<T> {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A completion that appends its result to this recorder.
    pub fn completion(&self) -> Completion<T> {
        let results = self.results.clone();
        Box::new(move |result| results.lock().push(result))
    }

    /// Number of results delivered.
    pub fn count(&self) -> usize {
        self.results.lock().len()
    }

    /// Remove and return every delivered result.
    pub fn take(&self) -> Vec<Result<T, Failure>> {
        std::mem::take(&mut *self.results.lock())
    }
}

impl<T: Clone> CompletionRecorder<T> {
    /// The most recent result, if any.
    pub fn last(&self) -> Option<Result<T, Failure>> {
        self.results.lock().last().cloned()
    }
}

impl<T: Send + 'static> Default for CompletionRecorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CompletionRecorder<T> {
    fn clone(&self) -> Self {
        Self {
            results: self.results.clone(),
        }
    }
}

/// Assert that a result succeeded.
///
/// # Example
///
/// ```rust
/// use paysub::{Failure, assert_succeeded};
///
/// let result: Result<u32, Failure> = Ok(1);
/// assert_succeeded!(result);
/// ```
#[macro_export]
macro_rules! assert_succeeded {
    ($result:expr) => {
        match $result {
            ::std::result::Result::Ok(_) => {}
            ::std::result::Result::Err(e) => {
                panic!("Expected Ok, got failure: {:?}", e);
            }
        }
    };
}

/// Assert that a result failed, optionally matching a pattern.
///
/// # Example
///
/// ```rust
/// use paysub::{Failure, assert_failed};
///
/// let result: Result<u32, Failure> = Err(Failure::server(503));
/// assert_failed!(result.clone());
/// assert_failed!(result, Failure::Server { status_code: 503, .. });
/// ```
#[macro_export]
macro_rules! assert_failed {
    ($result:expr) => {
        match $result {
            ::std::result::Result::Err(_) => {}
            ::std::result::Result::Ok(v) => {
                panic!("Expected failure, got Ok: {:?}", v);
            }
        }
    };
    ($result:expr, $pattern:pat) => {
        match $result {
            ::std::result::Result::Err($pattern) => {}
            ::std::result::Result::Err(e) => {
                panic!(
                    "Expected failure matching {}, got: {:?}",
                    stringify!($pattern),
                    e
                );
            }
            ::std::result::Result::Ok(v) => {
                panic!("Expected failure, got Ok: {:?}", v);
            }
        }
    };
}
