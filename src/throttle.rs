//! One-at-a-time access to a shared resource.
//!
//! [`Throttled`] wraps a resource (typically a client for an interactive web
//! authentication flow) behind a single-permit [`AsyncSemaphore`]. Every call
//! takes the permit, runs the wrapped operation and returns the permit on
//! every exit path: success, failure, cancellation or the caller dropping the
//! future. An optional minimum interval keeps the next caller waiting until
//! that much time has passed since the previous call started.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use paysub::Throttled;
//!
//! # tokio_test::block_on(async {
//! let session = Throttled::new("auth-session").with_min_interval(Duration::from_millis(10));
//!
//! let first = session.run(|name| async move { format!("{name}: first") }).await;
//! assert_eq!(first, "auth-session: first");
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cancellation::CancellationToken;
use crate::semaphore::AsyncSemaphore;

/// Minimum spacing applied to interactive authentication sessions.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Serializes calls on a wrapped resource.
#[derive(Debug)]
pub struct Throttled<R> {
    resource: R,
    semaphore: Arc<AsyncSemaphore>,
    min_interval: Option<Duration>,
}

impl<R> Throttled<R> {
    /// Wrap `resource` so that only one call runs at a time.
    pub fn new(resource: R) -> Self {
        Self {
            resource,
            semaphore: Arc::new(AsyncSemaphore::new(1)),
            min_interval: None,
        }
    }

    /// Keep the permit for at least `interval` after each call starts.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    /// Configured minimum interval between call starts.
    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// The wrapped resource, bypassing the throttle.
    pub fn get_ref(&self) -> &R {
        &self.resource
    }

    /// Unwrap the resource.
    pub fn into_inner(self) -> R {
        self.resource
    }

    /// Run `operation` once the permit is free.
    pub async fn run<'a, F, Fut>(&'a self, operation: F) -> Fut::Output
    where
        F: FnOnce(&'a R) -> Fut,
        Fut: Future,
    {
        self.semaphore.wait().await;
        let _permit = Permit::new(self);
        operation(&self.resource).await
    }

    /// Run `operation` once the permit is free, giving up if `token` is
    /// cancelled while waiting or while the operation runs.
    pub async fn run_unless_cancelled<'a, F, Fut, E>(
        &'a self,
        token: &CancellationToken,
        on_cancel: impl FnOnce() -> E,
        operation: F,
    ) -> Result<Fut::Output, E>
    where
        F: FnOnce(&'a R) -> Fut,
        Fut: Future,
    {
        if self
            .semaphore
            .wait_unless_cancelled(token, || ())
            .await
            .is_err()
        {
            return Err(on_cancel());
        }
        let _permit = Permit::new(self);
        let output = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = operation(&self.resource) => Some(output),
        };
        output.ok_or_else(on_cancel)
    }
}

/// Returns the throttle's permit when dropped.
struct Permit {
    semaphore: Arc<AsyncSemaphore>,
    started_at: Instant,
    min_interval: Option<Duration>,
}

impl Permit {
    fn new<R>(throttled: &Throttled<R>) -> Self {
        Self {
            semaphore: throttled.semaphore.clone(),
            started_at: Instant::now(),
            min_interval: throttled.min_interval,
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let remaining = self
            .min_interval
            .and_then(|interval| interval.checked_sub(self.started_at.elapsed()))
            .filter(|remaining| !remaining.is_zero());
        let runtime = tokio::runtime::Handle::try_current();
        match (remaining, runtime) {
            (Some(remaining), Ok(runtime)) => {
                let semaphore = self.semaphore.clone();
                tracing::trace!(?remaining, "holding throttle permit");
                runtime.spawn(async move {
                    tokio::time::sleep(remaining).await;
                    semaphore.signal();
                });
            }
            _ => self.semaphore.signal(),
        }
    }
}
