//! Many tasks hammering one pool while the health loop runs.
//!
//! Checks that the pool never goes over `max_size`, that the bookkeeping
//! always adds up, and that every opened connection is closed by the end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keel_pool::testing::MockFactory;
use keel_pool::{Pool, PoolConfig, PoolError};
use tokio::task::JoinSet;

const MAX_SIZE: usize = 8;

fn pool(factory: &MockFactory) -> Pool<MockFactory> {
    Pool::new(
        factory.clone(),
        PoolConfig {
            min_size: 2,
            max_size: MAX_SIZE,
            acquire_timeout: Duration::from_millis(200),
            health_check_interval: Duration::from_millis(5),
            health_check_timeout: Duration::from_millis(20),
            max_idle_time: Duration::from_millis(10),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_pool_stays_bounded_and_consistent() {
    let factory = MockFactory::new("stress");
    let pool = pool(&factory);
    pool.initialize().await.unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let sampler = tokio::spawn({
        let pool = pool.clone();
        let running = Arc::clone(&running);
        async move {
            let mut samples = 0u32;
            while running.load(Ordering::SeqCst) {
                let stats = pool.stats();
                assert!(stats.is_consistent(), "inconsistent: {stats:?}");
                assert!(stats.total + stats.pending <= MAX_SIZE, "over capacity: {stats:?}");
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        }
    });

    let mut tasks = JoinSet::new();
    for task in 0..64u64 {
        let pool = pool.clone();
        let factory = factory.clone();
        tasks.spawn(async move {
            for round in 0..20u64 {
                match pool.acquire().await {
                    Ok(mut conn) => {
                        conn.queries += 1;
                        tokio::time::sleep(Duration::from_micros(200)).await;
                        match (task + round) % 11 {
                            0 => conn.release(false).await.unwrap(),
                            1 => factory.fail_probes_for(conn.serial),
                            _ => conn.release(true).await.unwrap(),
                        }
                    }
                    Err(PoolError::AcquireTimeout { .. }) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    running.store(false, Ordering::SeqCst);
    assert!(sampler.await.unwrap() > 0);

    let stats = pool.stats();
    assert!(stats.is_consistent(), "{stats:?}");
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.waiting, 0);
    assert!(stats.acquired > 0);

    pool.shutdown(true).await;
    assert_eq!(pool.stats().total, 0);
    assert_eq!(factory.open_connections(), 0, "every connection is closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_probes_never_push_total_past_max_size() {
    let factory = MockFactory::new("probes");
    let pool = Pool::new(
        factory.clone(),
        PoolConfig {
            min_size: 4,
            max_size: 4,
            health_check_interval: Duration::from_millis(5),
            health_check_timeout: Duration::from_millis(20),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            ..Default::default()
        },
    )
    .unwrap();
    pool.initialize().await.unwrap();

    for serial in 1..=40 {
        factory.fail_probes_for(serial);
    }
    for _ in 0..40 {
        let stats = pool.stats();
        assert!(stats.total + stats.pending <= 4, "{stats:?}");
        assert!(stats.is_consistent(), "{stats:?}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(pool.stats().probe_failures > 0);
    pool.shutdown(true).await;
    assert_eq!(factory.open_connections(), 0);
}
