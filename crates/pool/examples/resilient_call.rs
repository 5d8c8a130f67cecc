//! A pooled backend behind a retry and a deadline.
//!
//! Run with `RUST_LOG=debug cargo run -p keel-pool --example resilient_call`
//! to watch connections being opened, probed and replaced.

use std::time::Duration;

use keel_pool::testing::MockFactory;
use keel_pool::{Pool, PoolConfig, PoolError};
use keel_resilience::ExponentialBackoff;
use keel_resilience::prelude::*;
use tracing_subscriber::EnvFilter;

async fn lookup(
    pool: &Pool<MockFactory>,
    user: u32,
) -> Result<String, ResilienceError<PoolError>> {
    let mut conn = pool.try_acquire().await.into_resilience()?;
    conn.queries += 1;
    let reply = format!("user {user} served by connection {}", conn.serial);
    // Every fifth connection misbehaves and is reported as broken.
    let healthy = conn.serial % 5 != 0;
    conn.release(healthy).await.into_resilience()?;
    Ok(reply)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let factory = MockFactory::new("users-db");
    let pool = Pool::new(
        factory.clone(),
        PoolConfig {
            min_size: 2,
            max_size: 3,
            acquire_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_millis(250),
            ..Default::default()
        },
    )?;
    pool.initialize().await?;

    let pipeline = Pipeline::builder()
        .timeout(TimeoutConfig::new(Duration::from_secs(2)))
        .retry(
            Retry::new(
                ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(200))
                    .with_jitter(0.1),
                5,
            )
            .retry_on([FailureKind::Exhausted, FailureKind::Connection]),
        )
        .build();

    let calls = (0..12).map(|user| {
        let pool = pool.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.execute(|| lookup(&pool, user)).await })
    });
    for call in futures::future::join_all(calls).await {
        match call? {
            Ok(reply) => println!("{reply}"),
            Err(err) => println!("call failed: {err}"),
        }
    }

    let stats = pool.stats();
    println!(
        "idle={} in_use={} total={} created={} closed={}",
        stats.idle, stats.in_use, stats.total, stats.created, stats.closed
    );

    pool.shutdown(true).await;
    println!("connections still open: {}", factory.open_connections());
    Ok(())
}
