//! Behavioral tests for the retrying executor.

use super::*;
use crate::cancellation::Cancellable;
use crate::failure::Failure;
use crate::testing::{CompletionRecorder, MockTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_test::traced_test;

fn unavailable() -> Result<String, Failure> {
    Err(Failure::server(503))
}

fn executor(
    script: impl IntoIterator<Item = Result<String, Failure>>,
    policy: RetryPolicy,
) -> (Arc<MockTransport<String>>, RetryingExecutor<MockTransport<String>>) {
    let transport = Arc::new(MockTransport::new(script));
    let executor = RetryingExecutor::new(transport.clone(), policy);
    (transport, executor)
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_on_third_attempt() {
    let (transport, executor) = executor(
        [
            Err(Failure::Timeout),
            Err(Failure::Timeout),
            Ok("paid".to_string()),
        ],
        RetryPolicy::constant(Duration::from_millis(10)).with_max_retries(2),
    );

    let result = executor.execute(Request::post("/payments")).await;

    assert_eq!(result, Ok("paid".to_string()));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhausted_returns_final_failure() {
    let (transport, executor) = executor(
        [
            unavailable(),
            unavailable(),
            Err(Failure::server(502)),
            Ok("too late".to_string()),
        ],
        RetryPolicy::constant(Duration::from_millis(10)).with_max_retries(2),
    );

    let result = executor.execute(Request::post("/payments")).await;

    assert_eq!(result, Err(Failure::server(502)));
    sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.calls(), 3);
    assert_eq!(transport.remaining(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_ends_immediately() {
    let (transport, executor) = executor(
        [Err(Failure::server(404)), Ok("unused".to_string())],
        RetryPolicy::constant(Duration::from_millis(10)).with_max_retries(3),
    );

    let result = executor.execute(Request::get("/customers/cus_1")).await;

    assert_eq!(result, Err(Failure::server(404)));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_predicate() {
    let (transport, executor) = executor(
        [Err(Failure::server(404)), Ok("found".to_string())],
        RetryPolicy::constant(Duration::from_millis(10)).with_max_retries(1),
    );
    let executor =
        executor.with_should_retry(|failure| failure.status_code() == Some(404));

    let result = executor.execute(Request::get("/eventually-consistent")).await;

    assert_eq!(result, Ok("found".to_string()));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_between_attempts() {
    let (transport, executor) = executor(
        [unavailable(), unavailable(), Ok("ok".to_string())],
        RetryPolicy::exponential(Duration::from_secs(1)).with_max_retries(2),
    );
    let start = tokio::time::Instant::now();

    executor.execute(Request::get("/status")).await.unwrap();

    // 1s + 2s of backoff.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_millis(3100));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_while_retries_remain() {
    let (transport, executor) = executor(
        std::iter::repeat_with(unavailable).take(10),
        RetryPolicy::constant(Duration::from_secs(1)).with_max_retries(10),
    );
    let executor = executor.with_timeout(Duration::from_millis(2500), Failure::Timeout);

    let result = executor.execute(Request::get("/slow")).await;

    assert_eq!(result, Err(Failure::Timeout));
    assert_eq!(transport.calls(), 3);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_configured_failure() {
    let transport = Arc::new(
        MockTransport::new([Ok("late".to_string())]).with_latency(Duration::from_secs(60)),
    );
    let executor = RetryingExecutor::new(transport, RetryPolicy::none())
        .with_timeout(Duration::from_secs(5), Failure::NetworkUnreachable);

    let result = executor.execute(Request::get("/hangs")).await;

    assert_eq!(result, Err(Failure::NetworkUnreachable));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_executing_completes_once() {
    let transport = Arc::new(
        MockTransport::new([Ok("late".to_string())]).with_latency(Duration::from_secs(10)),
    );
    let executor = RetryingExecutor::new(transport.clone(), RetryPolicy::none());
    let recorder = CompletionRecorder::new();

    let operation = executor.operation(Request::post("/refunds"), recorder.completion());
    operation.start();
    tokio::task::yield_now().await;
    assert_eq!(transport.calls(), 1);

    operation.cancel();
    operation.cancel();
    sleep(Duration::from_secs(20)).await;

    assert_eq!(recorder.take(), vec![Err(Failure::Cancelled)]);
    assert!(operation.is_completed());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_stops_retries() {
    let (transport, executor) = executor(
        [unavailable(), Ok("never sent".to_string())],
        RetryPolicy::constant(Duration::from_secs(10)).with_max_retries(1),
    );
    let recorder = CompletionRecorder::new();

    let operation = executor.operation(Request::put("/plans/basic"), recorder.completion());
    operation.start();
    sleep(Duration::from_secs(1)).await;
    assert!(format!("{:?}", operation).contains("waiting"));

    operation.cancel();
    sleep(Duration::from_secs(30)).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(recorder.take(), vec![Err(Failure::Cancelled)]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_and_after_completion_is_noop() {
    let (transport, executor) = executor(
        [Ok("done".to_string())],
        RetryPolicy::none(),
    );
    let recorder = CompletionRecorder::new();

    let operation = executor.operation(Request::get("/ping"), recorder.completion());
    operation.cancel();
    assert_eq!(recorder.count(), 0);

    operation.start();
    sleep(Duration::from_millis(1)).await;
    operation.cancel();
    operation.start();
    sleep(Duration::from_millis(1)).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(recorder.take(), vec![Ok("done".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_execute_future_cancels() {
    let transport = Arc::new(
        MockTransport::new([unavailable(), Ok("unused".to_string())])
            .with_latency(Duration::from_millis(100)),
    );
    let executor = RetryingExecutor::new(
        transport.clone(),
        RetryPolicy::constant(Duration::from_secs(1)).with_max_retries(1),
    );

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), executor.execute(Request::get("/x"))).await;
    assert!(abandoned.is_err());

    sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idempotency_key_is_stable_across_attempts() {
    for request in [
        Request::post("/charges"),
        Request::put("/charges/ch_1"),
        Request::delete("/charges/ch_1"),
    ] {
        let (transport, executor) = executor(
            [unavailable(), unavailable(), Ok("ok".to_string())],
            RetryPolicy::constant(Duration::from_millis(1)).with_max_retries(2),
        );

        executor.execute(request).await.unwrap();

        let keys: Vec<_> = transport
            .requests()
            .iter()
            .map(|r| r.idempotency_key().map(str::to_owned))
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(keys[0].is_some());
        assert!(keys.iter().all(|key| *key == keys[0]));
    }
}

#[tokio::test(start_paused = true)]
async fn test_get_requests_carry_no_idempotency_key() {
    let (transport, executor) = executor(
        [unavailable(), Ok("ok".to_string())],
        RetryPolicy::constant(Duration::from_millis(1)).with_max_retries(1),
    );

    executor.execute(Request::get("/balance")).await.unwrap();

    assert!(transport
        .requests()
        .iter()
        .all(|r| r.idempotency_key().is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_caller_supplied_idempotency_key_is_kept() {
    let (transport, executor) = executor([Ok("ok".to_string())], RetryPolicy::none());

    executor
        .execute(Request::post("/charges").with_header(IDEMPOTENCY_KEY_HEADER, "order-42"))
        .await
        .unwrap();

    assert_eq!(
        transport.requests()[0].idempotency_key(),
        Some("order-42")
    );
}

#[tokio::test(start_paused = true)]
async fn test_caller_key_in_lower_case_is_not_duplicated() {
    let (transport, executor) = executor(
        [unavailable(), Ok("ok".to_string())],
        RetryPolicy::constant(Duration::from_millis(1)).with_max_retries(1),
    );

    executor
        .execute(Request::post("/charges").with_header("idempotency-key", "order-7"))
        .await
        .unwrap();

    for request in transport.requests() {
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.idempotency_key(), Some("order-7"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_on_retry_observes_every_failed_attempt() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (_, executor) = executor(
        [unavailable(), unavailable(), Err(Failure::server(400))],
        RetryPolicy::exponential(Duration::from_millis(100)).with_max_retries(3),
    );
    let executor = executor.with_on_retry({
        let events = events.clone();
        move |event: &RetryEvent<'_>| {
            events
                .lock()
                .push((event.attempt, event.failure.status_code(), event.next_delay));
        }
    });

    let result = executor.execute(Request::post("/payouts")).await;

    assert_eq!(result, Err(Failure::server(400)));
    assert_eq!(
        *events.lock(),
        vec![
            (1, Some(503), Some(Duration::from_millis(100))),
            (2, Some(503), Some(Duration::from_millis(200))),
            (3, Some(400), None),
        ]
    );
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_retries_are_logged() {
    let (_, executor) = executor(
        [unavailable(), Ok("ok".to_string())],
        RetryPolicy::constant(Duration::from_millis(5)).with_max_retries(1),
    );

    executor.execute(Request::post("/invoices")).await.unwrap();

    assert!(logs_contain("request failed, retrying"));
    assert!(logs_contain("request succeeded"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_while_reruns_unsettled_success() {
    let mut calls = 0;
    let start = tokio::time::Instant::now();

    let result = retry_while(
        &RetryPolicy::linear(Duration::from_secs(1)).with_max_retries(5),
        Duration::from_secs(60),
        || {
            calls += 1;
            let status = if calls < 3 { "pending" } else { "captured" };
            async move { Ok::<_, Failure>(status) }
        },
        |result| matches!(result, Ok("pending")),
    )
    .await;

    assert_eq!(result, Ok("captured"));
    assert_eq!(calls, 3);
    // 1s + 2s of linear backoff.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_millis(3100));
}

#[tokio::test(start_paused = true)]
async fn test_retry_while_timeout_cuts_off_remaining_retries() {
    let calls = Arc::new(Mutex::new(0));
    let start = tokio::time::Instant::now();

    let result = retry_while(
        &RetryPolicy::constant(Duration::from_secs(1)).with_max_retries(10),
        Duration::from_millis(2500),
        || {
            *calls.lock() += 1;
            async { Ok::<_, Failure>("pending") }
        },
        |_| true,
    )
    .await;

    assert_eq!(result, Err(Failure::Timeout));
    assert_eq!(*calls.lock(), 3);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2500));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_retry_while_returns_last_result_when_budget_spent() {
    let mut calls = 0;

    let result = retry_while(
        &RetryPolicy::constant(Duration::from_millis(10)).with_max_retries(1),
        Duration::from_secs(60),
        || {
            calls += 1;
            async { unavailable() }
        },
        |result| matches!(result, Err(failure) if failure.is_retryable()),
    )
    .await;

    assert_eq!(result, Err(Failure::server(503)));
    assert_eq!(calls, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_while_stops_on_settled_failure() {
    let mut calls = 0;

    let result = retry_while(
        &RetryPolicy::constant(Duration::from_millis(10)).with_max_retries(3),
        Duration::from_secs(60),
        || {
            calls += 1;
            async { Err::<String, _>(Failure::server(404)) }
        },
        |result| matches!(result, Err(failure) if failure.is_retryable()),
    )
    .await;

    assert_eq!(result, Err(Failure::server(404)));
    assert_eq!(calls, 1);
}
