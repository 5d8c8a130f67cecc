//! The connection pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_resilience::{ExponentialBackoff, Retry, RetryError};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant as Deadline;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionId, ConnectionInfo};
use crate::error::{PoolError, Result};
use crate::factory::ConnectionFactory;
use crate::guard::PooledConnection;
use crate::health;
use crate::state::{Handoff, PoolState, PoolStats};

type Conn<F> = <F as ConnectionFactory>::Connection;

/// A bounded pool of connections opened by a [`ConnectionFactory`].
///
/// Cloning is cheap; clones share the same connections.
///
/// Callers get a [`PooledConnection`] from [`acquire`](Self::acquire) and hand
/// it back with [`PooledConnection::release`], or simply drop it. Waiting
/// callers are served strictly in arrival order.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    pub(crate) factory: F,
    pub(crate) config: PoolConfig,
    state: Mutex<PoolState<Conn<F>>>,
    /// Signalled after every bookkeeping change; drained shutdown waits on it.
    changed: Notify,
    pub(crate) shutdown: CancellationToken,
    tasks: TaskTracker,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

enum Step<C> {
    Ready(ConnectionId, C),
    Create,
    Wait(u64, oneshot::Receiver<Handoff<C>>),
    Exhausted,
    Closed,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Build a pool. No connection is opened until [`initialize`](Self::initialize)
    /// or the first [`acquire`](Self::acquire).
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let state = PoolState::new(config.max_size, config.max_lifetime);
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(state),
                changed: Notify::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                health_task: Mutex::new(None),
            }),
        })
    }

    /// Open connections up to `min_size` and start the health loop.
    ///
    /// Each connection gets `retry_attempts` tries with exponential backoff.
    /// If that is not enough the pool starts below `min_size` and the health
    /// loop keeps trying to fill it.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state.lock().is_closed() {
            return Err(PoolError::closed(inner.id()));
        }
        info!(
            pool = inner.id(),
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "initializing pool"
        );

        let opened = inner.replenish().await;
        let total = self.stats().total;
        if total < inner.config.min_size {
            warn!(
                pool = inner.id(),
                opened,
                total,
                min_size = inner.config.min_size,
                "pool started below min_size"
            );
        }

        {
            let mut task = inner.health_task.lock();
            if task.is_none() {
                *task = health::spawn_health_loop(inner);
            }
        }
        inner.update(|_, _| ())
    }

    /// The factory's identifier.
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection, waiting up to the configured `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection without waiting for one to be released.
    ///
    /// Still opens a new connection when there is spare capacity.
    pub async fn try_acquire(&self) -> Result<PooledConnection<F>> {
        self.acquire_timeout(Duration::ZERO).await
    }

    /// Acquire a connection, waiting up to `timeout`.
    ///
    /// An idle connection is reused first, then a new one is opened if the
    /// pool is below `max_size`. Otherwise the caller queues until a
    /// connection comes back or `timeout` elapses. A zero `timeout` never
    /// queues and fails with [`PoolError::Exhausted`] instead.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<F>> {
        let inner = &self.inner;
        let started = Deadline::now();
        // `None` for a zero timeout and for one too large to represent, which waits forever.
        let deadline = if timeout.is_zero() {
            None
        } else {
            started.checked_add(timeout)
        };

        let step = inner.update(|state, now| {
            if state.is_closed() {
                return Step::Closed;
            }
            // Queued callers come first; they already own anything that frees up.
            if !state.has_waiters() {
                if let Some((id, conn)) = state.checkout_idle(now) {
                    return Step::Ready(id, conn);
                }
                if state.try_reserve() {
                    return Step::Create;
                }
            }
            if timeout.is_zero() {
                return Step::Exhausted;
            }
            let (waiter, rx) = state.register_waiter();
            Step::Wait(waiter, rx)
        })?;

        let handoff = match step {
            Step::Closed => return Err(PoolError::closed(inner.id())),
            Step::Exhausted => {
                debug!(pool = inner.id(), "pool exhausted, not waiting");
                return Err(PoolError::Exhausted {
                    pool: inner.id().to_owned(),
                    max_size: inner.config.max_size,
                });
            }
            Step::Ready(id, conn) => Handoff::Connection(id, conn),
            Step::Create => Handoff::Create,
            Step::Wait(waiter, rx) => {
                let mut wait = Waiting {
                    inner,
                    id: waiter,
                    rx: Some(rx),
                };
                let received = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, wait.recv()).await,
                    None => Ok(wait.recv().await),
                };
                match received {
                    Ok(Some(handoff)) => handoff,
                    Ok(None) => return Err(PoolError::closed(inner.id())),
                    // A connection may have been handed over just as the deadline hit.
                    Err(_) => match wait.reclaim() {
                        Some(handoff @ Handoff::Connection(..)) => handoff,
                        Some(Handoff::Create) => {
                            inner.apply(|state, now| state.release_reservation(now));
                            return Err(inner.timed_out(started));
                        }
                        None => return Err(inner.timed_out(started)),
                    },
                }
            }
        };

        let conn = match handoff {
            Handoff::Connection(id, conn) => PooledConnection::new(Arc::clone(inner), id, conn),
            Handoff::Create => inner.open_reserved(deadline, started).await?,
        };
        debug!(pool = inner.id(), conn = %conn.id(), "connection acquired");
        Ok(conn)
    }

    /// Return a connection, reporting whether it still works.
    ///
    /// Same as [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<F>, healthy: bool) -> Result<()> {
        conn.release(healthy).await
    }

    /// Current counts.
    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats()
    }

    /// Snapshot of every tracked connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.state.lock().connections()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().is_closed()
    }

    #[cfg(test)]
    pub(crate) fn inner_for_tests(&self) -> Arc<PoolInner<F>> {
        Arc::clone(&self.inner)
    }

    /// Stop the health loop, fail every queued caller and close idle
    /// connections.
    ///
    /// With `drain`, also wait until every checked-out connection has been
    /// returned and closed. Without it, those connections are closed whenever
    /// their holders release them.
    pub async fn shutdown(&self, drain: bool) {
        let inner = &self.inner;
        info!(pool = inner.id(), drain, "shutting down pool");
        inner.shutdown.cancel();

        let health_task = inner.health_task.lock().take();
        if let Some(handle) = health_task {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(pool = inner.id(), "health loop panicked");
                }
            }
        }

        let idle = {
            let mut state = inner.state.lock();
            state.close();
            state.take_graveyard()
        };
        inner.changed.notify_waiters();
        inner.close_all(idle).await;

        if drain {
            loop {
                let notified = inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let busy = inner.state.lock().is_busy();
                if !busy {
                    break;
                }
                notified.await;
            }
        }

        inner.tasks.close();
        if drain {
            inner.tasks.wait().await;
        }
        let stats = self.stats();
        info!(
            pool = inner.id(),
            in_use = stats.in_use,
            closed = stats.closed,
            "pool shut down"
        );
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub(crate) fn id(&self) -> &str {
        self.factory.id()
    }

    /// Mutate the bookkeeping under the lock, then close anything retired
    /// and re-check the invariant.
    fn transact<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut PoolState<Conn<F>>, std::time::Instant) -> R,
    ) -> (R, Result<()>) {
        let (value, retired, check) = {
            let mut state = self.state.lock();
            let value = f(&mut state, std::time::Instant::now());
            (value, state.take_graveyard(), state.check_invariant())
        };
        self.changed.notify_waiters();
        self.spawn_close(retired);
        if let Err(err) = &check {
            error!(pool = self.id(), error = %err, "pool bookkeeping is inconsistent");
        }
        (value, check)
    }

    /// [`transact`](Self::transact), failing on an invariant violation.
    pub(crate) fn update<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut PoolState<Conn<F>>, std::time::Instant) -> R,
    ) -> Result<R> {
        let (value, check) = self.transact(f);
        check.map(|()| value)
    }

    /// [`transact`](Self::transact) for paths with no caller to report to.
    pub(crate) fn apply<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut PoolState<Conn<F>>, std::time::Instant) -> R,
    ) -> R {
        self.transact(f).0
    }

    fn timed_out(self: &Arc<Self>, started: Deadline) -> PoolError {
        self.apply(|state, _| state.record_timeout());
        let waited = started.elapsed();
        debug!(
            pool = self.id(),
            waited_ms = waited.as_millis() as u64,
            "timed out waiting for a connection"
        );
        PoolError::AcquireTimeout {
            pool: self.id().to_owned(),
            waited,
        }
    }

    /// Open a connection for capacity reserved on the caller's behalf.
    async fn open_reserved(
        self: &Arc<Self>,
        deadline: Option<Deadline>,
        started: Deadline,
    ) -> Result<PooledConnection<F>> {
        let reservation = Reservation::adopt(self);
        let created = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.factory.create()).await
            {
                Ok(created) => created,
                Err(_) => return Err(self.timed_out(started)),
            },
            None => self.factory.create().await,
        };
        let conn = created.map_err(|err| {
            warn!(pool = self.id(), error = %err, "failed to open connection");
            PoolError::connection(self.id(), err)
        })?;

        match reservation.commit_in_use()? {
            Some(id) => Ok(PooledConnection::new(Arc::clone(self), id, conn)),
            None => {
                self.spawn_close(vec![conn]);
                Err(PoolError::closed(self.id()))
            }
        }
    }

    /// Open connections until the pool holds `min_size`. Returns how many
    /// were opened.
    pub(crate) async fn replenish(self: &Arc<Self>) -> usize {
        let mut opened = 0;
        while let Some(reservation) = Reservation::for_deficit(self) {
            let created = tokio::select! {
                () = self.shutdown.cancelled() => break,
                created = self.create_with_retry() => created,
            };
            match created {
                Ok(conn) => {
                    if reservation.commit_idle(conn).is_err() {
                        break;
                    }
                    opened += 1;
                }
                Err(err) => {
                    warn!(
                        pool = self.id(),
                        attempts = err.attempts,
                        error = %err.error,
                        "could not open connection, pool is below min_size"
                    );
                    break;
                }
            }
        }
        if opened > 0 {
            debug!(pool = self.id(), opened, "replenished pool");
        }
        opened
    }

    async fn create_with_retry(&self) -> std::result::Result<Conn<F>, RetryError<F::Error>> {
        let backoff =
            ExponentialBackoff::new(self.config.retry_base_delay, self.config.retry_max_delay)
                .with_jitter(0.1);
        Retry::new(backoff, self.config.retry_attempts)
            .execute_if(|| self.factory.create(), |_: &F::Error| true)
            .await
    }

    pub(crate) fn spawn_replenish(self: &Arc<Self>) {
        let needed = {
            let state = self.state.lock();
            !state.is_closed() && state.deficit(self.config.min_size) > 0
        };
        if needed {
            let inner = Arc::clone(self);
            self.spawn(async move {
                inner.replenish().await;
            });
        }
    }

    /// Probe a connection with the configured deadline. Overrunning fails.
    pub(crate) async fn probe(&self, conn: &mut Conn<F>) -> bool {
        tokio::time::timeout(
            self.config.health_check_timeout,
            self.factory.health_check(conn),
        )
        .await
        .unwrap_or(false)
    }

    /// Return a connection from a caller.
    ///
    /// A broken connection comes back for the caller to close.
    pub(crate) fn give_back(
        self: &Arc<Self>,
        id: ConnectionId,
        conn: Conn<F>,
        healthy: bool,
    ) -> Result<Option<Conn<F>>> {
        let broken = self.update(|state, now| {
            if healthy {
                state.checkin(id, conn, now);
                None
            } else {
                state.mark_unhealthy(id);
                Some(conn)
            }
        })?;
        if broken.is_none() {
            self.spawn_replenish();
        }
        Ok(broken)
    }

    /// Close an `Unhealthy` connection and stop tracking it, then top the
    /// pool back up.
    pub(crate) async fn discard(self: &Arc<Self>, id: ConnectionId, conn: Conn<F>) {
        warn!(pool = self.id(), conn = %id, "closing unhealthy connection");
        let _closing = Closing { inner: self, id };
        self.factory.close(conn).await;
    }

    pub(crate) async fn close_all(&self, conns: Vec<Conn<F>>) {
        for conn in conns {
            self.factory.close(conn).await;
        }
    }

    fn spawn_close(self: &Arc<Self>, conns: Vec<Conn<F>>) {
        if conns.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        self.spawn(async move { inner.close_all(conns).await });
    }

    /// Run background work on the current runtime, if there is one.
    pub(crate) fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        match Handle::try_current() {
            Ok(handle) => {
                self.tasks.spawn_on(task, &handle);
            }
            Err(_) => debug!(pool = self.id(), "no runtime, skipping background work"),
        }
    }
}

/// Capacity reserved for a connection being opened. Released on drop unless
/// committed.
struct Reservation<'a, F: ConnectionFactory> {
    inner: &'a Arc<PoolInner<F>>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> Reservation<'a, F> {
    /// Take over a reservation already counted in the pool state.
    fn adopt(inner: &'a Arc<PoolInner<F>>) -> Self {
        Self { inner, armed: true }
    }

    /// Reserve capacity if the pool is below `min_size`.
    fn for_deficit(inner: &'a Arc<PoolInner<F>>) -> Option<Self> {
        let reserved = {
            let mut state = inner.state.lock();
            !state.is_closed() && state.deficit(inner.config.min_size) > 0 && state.try_reserve()
        };
        reserved.then(|| Self::adopt(inner))
    }

    /// Track a connection the caller keeps.
    fn commit_in_use(mut self) -> Result<Option<ConnectionId>> {
        self.armed = false;
        self.inner.update(|state, now| state.commit_in_use(now))
    }

    /// Track a connection as idle.
    fn commit_idle(mut self, conn: Conn<F>) -> Result<ConnectionId> {
        self.armed = false;
        match self.inner.update(|state, now| state.commit_idle(conn, now))? {
            Ok(id) => Ok(id),
            Err(conn) => {
                self.inner.spawn_close(vec![conn]);
                Err(PoolError::closed(self.inner.id()))
            }
        }
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.apply(|state, now| state.release_reservation(now));
        }
    }
}

/// A queued acquire. Dropping it, by timeout or by cancellation, withdraws
/// the caller and puts back anything handed over in the meantime.
struct Waiting<'a, F: ConnectionFactory> {
    inner: &'a Arc<PoolInner<F>>,
    id: u64,
    rx: Option<oneshot::Receiver<Handoff<Conn<F>>>>,
}

impl<F: ConnectionFactory> Waiting<'_, F> {
    /// `None` once the pool has shut down.
    async fn recv(&mut self) -> Option<Handoff<Conn<F>>> {
        let rx = self.rx.as_mut()?;
        let received = rx.await;
        self.rx = None;
        received.ok()
    }

    fn reclaim(&mut self) -> Option<Handoff<Conn<F>>> {
        let mut rx = self.rx.take()?;
        self.inner.state.lock().reclaim_waiter(self.id, &mut rx)
    }
}

impl<F: ConnectionFactory> Drop for Waiting<'_, F> {
    fn drop(&mut self) {
        if let Some(handoff) = self.reclaim() {
            debug!(pool = self.inner.id(), "acquire cancelled, returning handoff");
            self.inner.apply(|state, now| state.abandon(handoff, now));
        }
    }
}

/// Finishes retiring an `Unhealthy` connection, even if its close is cancelled.
struct Closing<'a, F: ConnectionFactory> {
    inner: &'a Arc<PoolInner<F>>,
    id: ConnectionId,
}

impl<F: ConnectionFactory> Drop for Closing<'_, F> {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.apply(|state, now| state.remove_unhealthy(id, now));
        self.inner.spawn_replenish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;
    use pretty_assertions::assert_eq;

    fn config(min_size: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            min_size,
            max_size,
            acquire_timeout: Duration::from_millis(100),
            health_check_interval: Duration::ZERO,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let err = Pool::new(MockFactory::new("db"), config(3, 2)).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn initialize_fills_to_min_size() {
        let pool = Pool::new(MockFactory::new("db"), config(2, 5)).unwrap();
        pool.initialize().await.unwrap();

        let stats = pool.stats();
        assert_eq!((stats.idle, stats.in_use, stats.total), (2, 0, 2));
        assert_eq!(stats.created, 2);
    }

    #[tokio::test]
    async fn initialize_starts_degraded_when_creates_keep_failing() {
        let factory = MockFactory::new("db");
        factory.fail_creates(u32::MAX);
        let pool = Pool::new(factory.clone(), config(2, 5)).unwrap();

        pool.initialize().await.unwrap();

        assert_eq!(pool.stats().total, 0);
        assert_eq!(factory.create_attempts(), pool.config().retry_attempts);
    }

    #[tokio::test]
    async fn initialize_retries_transient_create_failures() {
        let factory = MockFactory::new("db");
        factory.fail_creates(2);
        let pool = Pool::new(factory.clone(), config(1, 5)).unwrap();

        pool.initialize().await.unwrap();

        assert_eq!(pool.stats().total, 1);
        assert_eq!(factory.create_attempts(), 3);
    }

    #[tokio::test]
    async fn round_trip_reuses_the_same_connection() {
        let pool = Pool::new(MockFactory::new("db"), config(1, 2)).unwrap();
        pool.initialize().await.unwrap();

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        let serial = conn.serial;
        conn.release(true).await.unwrap();

        let again = pool.acquire().await.unwrap();
        assert_eq!((again.id(), again.serial), (id, serial));
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn try_acquire_opens_when_capacity_remains() {
        let pool = Pool::new(MockFactory::new("db"), config(0, 1)).unwrap();
        let held = pool.try_acquire().await.unwrap();

        let err = pool.try_acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { max_size: 1, .. }));
        drop(held);
    }

    #[tokio::test]
    async fn create_failure_surfaces_connection_error_and_frees_capacity() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(factory.clone(), config(0, 1)).unwrap();
        factory.fail_creates(1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connection { .. }));
        assert_eq!(pool.stats().pending, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn unhealthy_release_closes_and_replaces() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(factory.clone(), config(1, 2)).unwrap();
        pool.initialize().await.unwrap();

        let conn = pool.acquire().await.unwrap();
        let broken = conn.serial;
        conn.release(false).await.unwrap();

        assert!(factory.closed().contains(&broken));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.unhealthy, stats.total), (1, 0, 1));
        assert_eq!(stats.created, 2);
    }

    #[tokio::test]
    async fn probe_on_release_catches_dead_connections() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(
            factory.clone(),
            PoolConfig {
                probe_on_release: true,
                ..config(0, 2)
            },
        )
        .unwrap();

        let conn = pool.acquire().await.unwrap();
        let serial = conn.serial;
        factory.fail_probes_for(serial);
        conn.release(true).await.unwrap();

        assert!(factory.closed().contains(&serial));
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn expired_connection_is_replaced_on_release() {
        let factory = MockFactory::new("db");
        let pool = Pool::new(
            factory.clone(),
            PoolConfig {
                max_lifetime: Duration::from_millis(20),
                ..config(0, 2)
            },
        )
        .unwrap();

        let conn = pool.acquire().await.unwrap();
        let old = conn.serial;
        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.release(true).await.unwrap();
        assert_eq!(pool.stats().total, 0);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.serial, old);
    }

    #[tokio::test]
    async fn shutdown_fails_later_acquires() {
        let pool = Pool::new(MockFactory::new("db"), config(1, 2)).unwrap();
        pool.initialize().await.unwrap();
        pool.shutdown(false).await;

        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed { .. })));
        assert_eq!(pool.stats().total, 0);
    }
}
