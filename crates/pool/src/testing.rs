//! Testing utilities for pools
//!
//! [`MockFactory`] hands out numbered [`MockConnection`]s and records what the
//! pool does with them. Failures and latency can be injected at any time; all
//! clones of a factory share the same switches and counters.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use keel_resilience::{Classify, FailureKind};
use parking_lot::Mutex;

use crate::factory::ConnectionFactory;

/// A fake connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConnection {
    /// Creation order, starting at 1.
    pub serial: u64,
    /// Free for tests to count work done on the connection.
    pub queries: u64,
}

/// Error returned by an injected create failure.
#[derive(Debug, thiserror::Error)]
#[error("mock connection refused (attempt {attempt})")]
pub struct MockError {
    /// Which create call failed.
    pub attempt: u32,
}

impl Classify for MockError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Connection
    }
}

#[derive(Default)]
struct Shared {
    next_serial: AtomicU64,
    create_attempts: AtomicU32,
    create_failures: AtomicU32,
    create_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    failing_probes: Mutex<HashSet<u64>>,
    probes: AtomicU64,
    closed: Mutex<Vec<u64>>,
}

/// A scriptable [`ConnectionFactory`].
#[derive(Clone)]
pub struct MockFactory {
    id: Arc<str>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFactory")
            .field("id", &self.id)
            .field("created", &self.created())
            .field("closed", &self.shared.closed.lock().len())
            .finish()
    }
}

impl MockFactory {
    /// A factory whose connections always open and always pass probes.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            shared: Arc::default(),
        }
    }

    /// Make the next `count` create calls fail.
    pub fn fail_creates(&self, count: u32) {
        self.shared.create_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every create call.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.shared.create_delay.lock() = delay;
    }

    /// Delay every probe.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.shared.probe_delay.lock() = delay;
    }

    /// Make probes of the connection with this serial fail from now on.
    pub fn fail_probes_for(&self, serial: u64) {
        self.shared.failing_probes.lock().insert(serial);
    }

    /// Create calls made so far, failed ones included.
    pub fn create_attempts(&self) -> u32 {
        self.shared.create_attempts.load(Ordering::SeqCst)
    }

    /// Connections successfully opened.
    pub fn created(&self) -> u64 {
        self.shared.next_serial.load(Ordering::SeqCst)
    }

    /// Serials of closed connections, in closing order.
    pub fn closed(&self) -> Vec<u64> {
        self.shared.closed.lock().clone()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.created() - self.shared.closed.lock().len() as u64
    }

    /// Probes run so far.
    pub fn probe_count(&self) -> u64 {
        self.shared.probes.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;
    type Error = MockError;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&self) -> Result<MockConnection, MockError> {
        let attempt = self.shared.create_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.shared.create_delay.lock();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .shared
            .create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(MockError { attempt });
        }

        let serial = self.shared.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection { serial, queries: 0 })
    }

    async fn health_check(&self, conn: &mut MockConnection) -> bool {
        self.shared.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        !self.shared.failing_probes.lock().contains(&conn.serial)
    }

    async fn close(&self, conn: MockConnection) {
        self.shared.closed.lock().push(conn.serial);
    }
}
