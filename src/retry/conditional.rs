//! Re-running an arbitrary async operation until its result settles.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::failure::Failure;
use crate::retry::policy::RetryPolicy;

/// Run `operation` again while `condition` holds for its result, backing off
/// between runs according to `policy`.
///
/// Unlike [`RetryingExecutor`](crate::RetryingExecutor), the condition sees
/// successes too, so a value that is valid but not final yet (an invoice
/// still `pending`, say) can be retried. Once the condition no longer holds
/// or the policy runs out of retries, the latest result is returned as is.
///
/// The whole loop, including the backoff, is bounded by `limit`; when it
/// elapses the run in progress is dropped and [`Failure::Timeout`] is
/// returned.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use paysub::{retry_while, Failure, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let mut checks = 0;
/// let status = retry_while(
///     &RetryPolicy::linear(Duration::from_millis(1)).with_max_retries(5),
///     Duration::from_secs(5),
///     || {
///         checks += 1;
///         let status = if checks < 3 { "pending" } else { "captured" };
///         async move { Ok::<_, Failure>(status) }
///     },
///     |result| matches!(result, Ok("pending")),
/// )
/// .await;
///
/// assert_eq!(status, Ok("captured"));
/// assert_eq!(checks, 3);
/// # });
/// ```
pub async fn retry_while<T, F, Fut, C>(
    policy: &RetryPolicy,
    limit: Duration,
    mut operation: F,
    condition: C,
) -> Result<T, Failure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
    C: Fn(&Result<T, Failure>) -> bool,
{
    let attempts = async {
        let mut attempt = 0;
        loop {
            let result = operation().await;
            if !condition(&result) {
                return result;
            }
            let Some(delay) = policy.delay_for_attempt(attempt) else {
                tracing::debug!(attempt, "retry budget spent, returning last result");
                return result;
            };
            tracing::trace!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "result not settled, running again"
            );
            sleep(delay).await;
            attempt += 1;
        }
    };

    match timeout(limit, attempts).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "retry loop timed out");
            Err(Failure::Timeout)
        }
    }
}
