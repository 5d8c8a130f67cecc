//! Retry, bulkhead and timeout stacked around a flaky backend.
//!
//! `RUST_LOG=keel_resilience=debug cargo run -p keel-resilience --example pipeline_demo`

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use keel_resilience::ExponentialBackoff;
use keel_resilience::prelude::*;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum BackendError {
    #[error("connection reset")]
    Reset,
    #[error("malformed request")]
    BadRequest,
}

impl Classify for BackendError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Reset => FailureKind::Connection,
            Self::BadRequest => FailureKind::Permanent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = BulkheadRegistry::new(BulkheadConfig {
        max_concurrent: 2,
        max_wait: Duration::from_millis(500),
    })?;
    let pipeline = Arc::new(
        Pipeline::builder()
            .timeout(TimeoutConfig::new(Duration::from_secs(1)).with_message("backend call"))
            .bulkhead(registry.get_or_create("backend"))
            .retry(Retry::new(
                ExponentialBackoff::new(Duration::from_millis(20), Duration::from_millis(200))
                    .with_jitter(0.1),
                4,
            ))
            .build(),
    );

    let counter = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for request in 0..6u32 {
        let pipeline = Arc::clone(&pipeline);
        let counter = Arc::clone(&counter);
        handles.push(tokio::spawn(async move {
            let result = pipeline
                .execute(|| {
                    let counter = Arc::clone(&counter);
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        match (request, n % 3) {
                            (5, _) => Err(ResilienceError::Operation(BackendError::BadRequest)),
                            (_, 0) => Err(ResilienceError::Operation(BackendError::Reset)),
                            _ => Ok(format!("request {request} done")),
                        }
                    }
                })
                .await;
            (request, result)
        }));
    }

    for handle in handles {
        match handle.await? {
            (_, Ok(reply)) => println!("{reply}"),
            (request, Err(err)) => println!("request {request} failed: {err}"),
        }
    }

    for (name, stats) in registry.stats() {
        println!(
            "{name}: completed={} failed={} rejected={} success_rate={:.2}",
            stats.total_completed, stats.total_failed, stats.total_rejected, stats.success_rate
        );
    }
    println!("backend invoked {} times", counter.load(Ordering::SeqCst));
    Ok(())
}
