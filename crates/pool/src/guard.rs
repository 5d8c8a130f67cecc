//! RAII handle for a checked-out connection

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use crate::connection::ConnectionId;
use crate::error::Result;
use crate::factory::ConnectionFactory;
use crate::pool::PoolInner;

/// A connection checked out of a [`Pool`](crate::Pool).
///
/// Dereferences to the underlying connection. Dropping the handle returns the
/// connection as healthy, or as broken after [`mark_unhealthy`](Self::mark_unhealthy);
/// [`release`](Self::release) does the same but lets the caller await the
/// outcome.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    id: ConnectionId,
    conn: Option<F::Connection>,
    healthy: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, id: ConnectionId, conn: F::Connection) -> Self {
        Self {
            pool,
            id,
            conn: Some(conn),
            healthy: true,
        }
    }

    /// The connection's identifier within its pool.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Flag the connection as broken so that dropping the handle closes it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Return the connection to the pool.
    ///
    /// With `healthy == false` the connection is closed and a replacement is
    /// opened in the background if the pool fell below `min_size`. A healthy
    /// connection past `max_lifetime` is closed instead of being reused.
    pub async fn release(mut self, healthy: bool) -> Result<()> {
        let mut healthy = healthy && self.healthy;
        if healthy && self.pool.config.probe_on_release {
            if let Some(conn) = self.conn.as_mut() {
                healthy = self.pool.probe(conn).await;
            }
        }

        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if let Some(broken) = self.pool.give_back(self.id, conn, healthy)? {
            self.pool.discard(self.id, broken).await;
        }
        Ok(())
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        self.conn
            .as_ref()
            .expect("connection already returned to the pool")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.conn
            .as_mut()
            .expect("connection already returned to the pool")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = self.id;
        match self.pool.give_back(id, conn, self.healthy) {
            Ok(Some(broken)) if Handle::try_current().is_ok() => {
                let pool = Arc::clone(&self.pool);
                self.pool.spawn(async move { pool.discard(id, broken).await });
            }
            Ok(Some(broken)) => {
                warn!(
                    pool = self.pool.id(),
                    conn = %id,
                    "no runtime, dropping unhealthy connection without closing it"
                );
                drop(broken);
                self.pool
                    .apply(|state, now| state.remove_unhealthy(id, now));
            }
            Ok(None) | Err(_) => {}
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F>
where
    F::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.id())
            .field("id", &self.id)
            .field("conn", &self.conn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::MockFactory;
    use crate::{Pool, PoolConfig};
    use std::time::Duration;

    fn pool(factory: &MockFactory) -> Pool<MockFactory> {
        Pool::new(
            factory.clone(),
            PoolConfig {
                min_size: 0,
                max_size: 2,
                health_check_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn deref_reaches_the_connection() {
        let factory = MockFactory::new("db");
        let pool = pool(&factory);
        let mut conn = pool.acquire().await.unwrap();

        assert_eq!(conn.serial, 1);
        conn.queries += 1;
        assert_eq!(conn.queries, 1);
    }

    #[tokio::test]
    async fn drop_returns_connection_as_idle() {
        let factory = MockFactory::new("db");
        let pool = pool(&factory);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 1);

        drop(conn);
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.in_use), (1, 0));
    }

    #[tokio::test]
    async fn marked_connection_is_closed_on_drop() {
        let factory = MockFactory::new("db");
        let pool = pool(&factory);
        let mut conn = pool.acquire().await.unwrap();
        let serial = conn.serial;

        conn.mark_unhealthy();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(factory.closed(), vec![serial]);
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn marked_connection_dropped_outside_runtime_is_untracked() {
        let factory = MockFactory::new("db");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (pool, mut conn) = rt.block_on(async {
            let pool = pool(&factory);
            let conn = pool.acquire().await.unwrap();
            (pool, conn)
        });
        conn.mark_unhealthy();

        drop(conn);

        assert_eq!(pool.stats().total, 0);
        assert!(factory.closed().is_empty());
        assert_eq!(factory.open_connections(), 1);
    }

    #[tokio::test]
    async fn marked_connection_stays_broken_on_healthy_release() {
        let factory = MockFactory::new("db");
        let pool = pool(&factory);
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_unhealthy();

        conn.release(true).await.unwrap();
        assert_eq!(factory.closed().len(), 1);
    }
}
