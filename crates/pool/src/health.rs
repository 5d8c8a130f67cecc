//! Background health checking and idle maintenance.
//!
//! One task per pool. Every `health_check_interval` it:
//!
//! 1. evicts idle connections past `max_lifetime`, and those idle longer than
//!    `max_idle_time` while the pool stays at or above `min_size`;
//! 2. probes the remaining idle connections concurrently, each bounded by
//!    `health_check_timeout`, closing every one that fails;
//! 3. opens connections back up to `min_size`.
//!
//! The task holds only a weak reference to the pool and stops when the pool's
//! shutdown token is cancelled or the pool is dropped.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::factory::ConnectionFactory;
use crate::pool::PoolInner;

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub(crate) probed: usize,
    pub(crate) failed: usize,
    pub(crate) opened: usize,
}

/// Start the loop. `None` when the interval is zero.
pub(crate) fn spawn_health_loop<F: ConnectionFactory>(
    inner: &Arc<PoolInner<F>>,
) -> Option<JoinHandle<()>> {
    let interval = inner.config.health_check_interval;
    if interval.is_zero() {
        return None;
    }

    let pool = Arc::downgrade(inner);
    let cancel = inner.shutdown.clone();
    let id = inner.id().to_owned();

    Some(tokio::spawn(async move {
        debug!(
            pool = %id,
            interval_ms = interval.as_millis() as u64,
            "health loop started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let Some(inner) = pool.upgrade() else {
                break;
            };
            let report = inner.health_cycle().await;
            trace!(
                pool = %id,
                probed = report.probed,
                failed = report.failed,
                opened = report.opened,
                "health cycle finished"
            );
        }
        debug!(pool = %id, "health loop stopped");
    }))
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub(crate) async fn health_cycle(self: &Arc<Self>) -> CycleReport {
        let min_size = self.config.min_size;
        let max_idle_time = self.config.max_idle_time;
        let probes =
            self.apply(|state, now| state.begin_health_cycle(min_size, max_idle_time, now));
        let probed = probes.len();

        let results = join_all(probes.into_iter().map(|(id, mut conn)| async move {
            let healthy = self.probe(&mut conn).await;
            (id, conn, healthy)
        }))
        .await;

        let mut broken = Vec::new();
        for (id, conn, healthy) in results {
            if let Some(conn) = self.apply(|state, now| state.end_probe(id, conn, healthy, now)) {
                broken.push((id, conn));
            }
        }

        let failed = broken.len();
        for (id, conn) in broken {
            self.discard(id, conn).await;
        }

        let opened = self.replenish().await;
        CycleReport {
            probed,
            failed,
            opened,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;
    use crate::{Pool, PoolConfig};
    use std::time::Duration;

    fn config(min_size: usize) -> PoolConfig {
        PoolConfig {
            min_size,
            max_size: 4,
            health_check_interval: Duration::from_millis(20),
            health_check_timeout: Duration::from_millis(50),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn zero_interval_disables_the_loop() {
        let pool = Pool::new(
            MockFactory::new("db"),
            PoolConfig {
                health_check_interval: Duration::ZERO,
                ..config(1)
            },
        )
        .unwrap();
        assert!(spawn_health_loop(&pool.inner_for_tests()).is_none());
    }

    #[tokio::test]
    async fn failed_probe_replaces_connection() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(factory.clone(), config(1)).unwrap();
        pool.initialize().await.unwrap();
        factory.fail_probes_for(1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(factory.closed().contains(&1));
        let stats = pool.stats();
        assert!(stats.probe_failures >= 1);
        assert_eq!((stats.idle, stats.unhealthy, stats.total), (1, 0, 1));
        pool.shutdown(true).await;
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(
            factory.clone(),
            PoolConfig {
                health_check_interval: Duration::ZERO,
                ..config(1)
            },
        )
        .unwrap();
        pool.initialize().await.unwrap();
        factory.set_probe_delay(Duration::from_millis(200));

        let report = pool.inner_for_tests().health_cycle().await;

        assert_eq!(report.probed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.opened, 1);
        assert_eq!(pool.stats().probe_failures, 1);
    }

    #[tokio::test]
    async fn cycle_evicts_stale_idle_connections_above_min_size() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(
            factory.clone(),
            PoolConfig {
                health_check_interval: Duration::ZERO,
                max_idle_time: Duration::from_millis(10),
                ..config(1)
            },
        )
        .unwrap();
        let held = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        drop(held);
        assert_eq!(pool.stats().idle, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = pool.inner_for_tests().health_cycle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(report.probed, 1);
        assert_eq!(pool.stats().total, 1);
        assert_eq!(factory.closed().len(), 2);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(factory.clone(), config(1)).unwrap();
        pool.initialize().await.unwrap();
        pool.shutdown(true).await;

        let probes = factory.probe_count();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(factory.probe_count(), probes);
    }
}
