//! # Keel Pool
//!
//! A bounded async connection pool.
//!
//! - Connections come from a [`ConnectionFactory`]; the pool never holds its
//!   lock while the factory runs.
//! - [`Pool::acquire`] reuses an idle connection, opens a new one below
//!   `max_size`, or queues the caller (first come, first served) until one is
//!   released or the acquire deadline passes.
//! - A background task probes idle connections, evicts stale ones and keeps
//!   the pool at `min_size`, retrying failed opens with
//!   [`keel_resilience`] exponential backoff.
//! - Bookkeeping is re-checked after every change: `idle + in_use + unhealthy`
//!   always equals `total`, or the operation fails with
//!   [`PoolError::InvariantViolation`], which resilience policies never retry.
//!
//! The `testing` feature adds `MockFactory`, a scripted in-memory factory.
//!
//! ## Quick Start
//!
//! ```rust
//! use keel_pool::testing::MockFactory;
//! use keel_pool::{Pool, PoolConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> keel_pool::Result<()> {
//!     let pool = Pool::new(MockFactory::new("db"), PoolConfig::default())?;
//!     pool.initialize().await?;
//!
//!     let mut conn = pool.acquire().await?;
//!     conn.queries += 1;
//!     conn.release(true).await?;
//!
//!     assert_eq!(pool.stats().idle, 1);
//!     pool.shutdown(true).await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod guard;
mod health;
mod pool;
mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::PoolConfig;
pub use connection::{ConnectionId, ConnectionInfo, ConnectionState};
pub use error::{PoolError, Result};
pub use factory::ConnectionFactory;
pub use guard::PooledConnection;
pub use pool::Pool;
pub use state::PoolStats;
