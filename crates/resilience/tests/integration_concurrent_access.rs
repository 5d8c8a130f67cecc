//! Integration tests for concurrent access
//!
//! - Bulkhead concurrency limits under load
//! - Immediate rejection when full
//! - Registry sharing across tasks

use futures::future::join_all;
use keel_resilience::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
#[error("unused")]
struct Never;

impl Classify for Never {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Permanent
    }
}

/// Test: Bulkhead enforces concurrency limit
#[tokio::test]
async fn test_bulkhead_concurrency_limit() {
    let bulkhead = Bulkhead::new(
        "limit",
        BulkheadConfig {
            max_concurrent: 3,
            max_wait: Duration::from_secs(5),
        },
    )
    .unwrap();
    let active = &AtomicU32::new(0);
    let max_observed = &AtomicU32::new(0);
    let bulkhead = &bulkhead;

    let results = join_all((0..10).map(move |_| {
        bulkhead.execute(move || async move {
            let current = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_observed.fetch_max(current, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, ResilienceError<Never>>(())
        })
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert!(max_observed.load(Ordering::SeqCst) <= 3);
    let stats = bulkhead.stats();
    assert_eq!(stats.total_completed, 10);
    assert_eq!(stats.current_concurrent, 0);
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
}

/// Test: A full bulkhead rejects `try_execute` without running the operation
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_bulkhead_rejects_immediately() {
    let bulkhead = Arc::new(
        Bulkhead::new(
            "full",
            BulkheadConfig {
                max_concurrent: 1,
                max_wait: Duration::from_secs(1),
            },
        )
        .unwrap(),
    );
    let holder = tokio::spawn({
        let bulkhead = Arc::clone(&bulkhead);
        async move {
            bulkhead
                .execute(|| async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, ResilienceError<Never>>(())
                })
                .await
        }
    });
    sleep(Duration::from_millis(20)).await;

    let ran = AtomicU32::new(0);
    let result = bulkhead
        .try_execute(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ResilienceError<Never>>(())
        })
        .await;

    assert!(result.unwrap_err().is_rejected());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    holder.await.unwrap().unwrap();
    assert_eq!(bulkhead.stats().total_rejected, 1);
}

/// Test: Every task asking the registry for a name gets the same bulkhead
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_shared_across_tasks() {
    let registry = Arc::new(BulkheadRegistry::new(BulkheadConfig::default()).unwrap());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let name = if i % 2 == 0 { "orders" } else { "users" };
                registry.get_or_create(name)
            })
        })
        .collect();

    let mut orders = Vec::new();
    for handle in handles {
        let bulkhead = handle.await.unwrap();
        if bulkhead.name() == "orders" {
            orders.push(bulkhead);
        }
    }

    assert_eq!(orders.len(), 8);
    assert!(orders.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(registry.names(), vec!["orders".to_owned(), "users".to_owned()]);
}
