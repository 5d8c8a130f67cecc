//! The seam between a pool and the thing it pools.

use std::future::Future;

/// Opens, probes and closes connections of one kind.
///
/// A [`Pool`](crate::Pool) owns exactly one factory and never holds its lock
/// while any of these futures runs.
///
/// ```
/// use keel_pool::ConnectionFactory;
///
/// struct Counter;
///
/// impl ConnectionFactory for Counter {
///     type Connection = u64;
///     type Error = std::io::Error;
///
///     fn id(&self) -> &str {
///         "counter"
///     }
///
///     async fn create(&self) -> Result<u64, std::io::Error> {
///         Ok(0)
///     }
///
///     async fn health_check(&self, _conn: &mut u64) -> bool {
///         true
///     }
/// }
/// ```
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The pooled connection.
    type Connection: Send + 'static;

    /// Error returned when a connection cannot be opened.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identifier used in errors and logs.
    fn id(&self) -> &str;

    /// Open a new connection.
    fn create(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    /// Probe a connection. `false` marks it unhealthy.
    fn health_check(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send;

    /// Tear a connection down. Dropping it is the default.
    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send {
        async move { drop(conn) }
    }
}
