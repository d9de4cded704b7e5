//! Subscription checkout against a simulated payments API
//!
//! Walks through the three building blocks:
//! 1. Create a subscription through the retrying executor (the API drops the
//!    first two requests)
//! 2. Poll the first invoice until its payment settles
//! 3. Run two 3-D Secure challenges through a throttled session
//!
//! Run with: cargo run --example payment_flow

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paysub::prelude::*;
use paysub::{Method, DEFAULT_MIN_INTERVAL};

// =============================================================================
// Simulated API
// =============================================================================

#[derive(Debug, Clone)]
enum Resource {
    Subscription { id: String, invoice: String },
    Invoice { id: String, status: &'static str },
}

#[derive(Default)]
struct SimulatedApi {
    requests: AtomicU32,
    invoice_checks: AtomicU32,
}

#[async_trait]
impl Transport for SimulatedApi {
    type Response = Resource;

    async fn execute(&self, request: Request) -> Result<Resource, Failure> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let n = self.requests.fetch_add(1, Ordering::SeqCst);

        match (request.method, request.path.as_str()) {
            (Method::Post, "/subscriptions") if n < 2 => Err(Failure::NetworkUnreachable),
            (Method::Post, "/subscriptions") => Ok(Resource::Subscription {
                id: "sub_1".to_string(),
                invoice: "in_1".to_string(),
            }),
            (Method::Get, path) if path.starts_with("/invoices/") => {
                let checks = self.invoice_checks.fetch_add(1, Ordering::SeqCst);
                let status = if checks < 3 { "processing" } else { "paid" };
                Ok(Resource::Invoice {
                    id: path.trim_start_matches("/invoices/").to_string(),
                    status,
                })
            }
            _ => Err(Failure::server(404)),
        }
    }
}

// =============================================================================
// Example 1: Retrying executor
// =============================================================================

async fn create_subscription(
    executor: &RetryingExecutor<SimulatedApi>,
) -> Result<(String, String), Failure> {
    println!("\n=== Example 1: Create subscription ===");

    let request = Request::post("/subscriptions").with_body(r#"{"plan":"pro"}"#);
    match executor.execute(request).await? {
        Resource::Subscription { id, invoice } => {
            println!("  Created {id}, first invoice {invoice}");
            Ok((id, invoice))
        }
        other => Err(Failure::Internal(format!("unexpected resource {other:?}"))),
    }
}

// =============================================================================
// Example 2: Polling
// =============================================================================

async fn wait_for_payment(
    executor: RetryingExecutor<SimulatedApi>,
    invoice: String,
) -> Result<Resource, Failure> {
    println!("\n=== Example 2: Poll invoice until settled ===");

    let executor = Arc::new(executor);
    let invoice = poll(
        PollingConfig::new(Duration::from_secs(10), Duration::from_millis(200)),
        move || {
            let executor = executor.clone();
            let path = format!("/invoices/{invoice}");
            async move { executor.execute(Request::get(path)).await }
        },
        |result| matches!(result, Ok(Resource::Invoice { status: "processing", .. })),
    )
    .await?;

    if let Resource::Invoice { id, status } = &invoice {
        println!("  Invoice {id} is {status}");
    }
    Ok(invoice)
}

// =============================================================================
// Example 3: Throttled authentication
// =============================================================================

struct ChallengeWindow;

impl ChallengeWindow {
    async fn present(&self, url: &str) -> Result<String, Failure> {
        println!("  Presenting challenge {url}");
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(format!("{url}#authenticated"))
    }
}

async fn authenticate_twice() -> Result<(), Failure> {
    println!("\n=== Example 3: Throttled 3-D Secure challenges ===");

    let window = Throttled::new(ChallengeWindow).with_min_interval(DEFAULT_MIN_INTERVAL);
    let token = CancellationToken::new();

    let (first, second) = tokio::join!(
        window.run(|w| w.present("https://acs.example/challenge/1")),
        window.run_unless_cancelled(&token, || Failure::Cancelled, |w| {
            w.present("https://acs.example/challenge/2")
        }),
    );
    println!("  Results: {:?} / {:?}", first?, second??);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Failure> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let api = Arc::new(SimulatedApi::default());
    let executor = RetryingExecutor::new(
        api,
        RetryPolicy::exponential_with_rate(Duration::from_millis(100), 3).with_max_retries(3),
    )
    .with_on_retry(|event| {
        tracing::info!(
            attempt = event.attempt,
            next_delay = ?event.next_delay,
            "attempt failed: {}",
            event.failure
        );
    });

    let (_, invoice) = create_subscription(&executor).await?;
    wait_for_payment(executor, invoice).await?;
    authenticate_twice().await?;

    println!("\nDone.");
    Ok(())
}
