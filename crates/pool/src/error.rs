//! Error types for the connection pool
use std::time::Duration;

use keel_resilience::{Classify, FailureKind};
use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Everything a pool operation can fail with.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Every connection is in use and the caller asked not to wait.
    #[error("pool '{pool}' exhausted: all {max_size} connections are in use")]
    Exhausted {
        /// The pool identifier
        pool: String,
        /// The configured maximum
        max_size: usize,
    },

    /// No connection became available before the acquire deadline.
    #[error("timed out after {waited:?} waiting for a connection from pool '{pool}'")]
    AcquireTimeout {
        /// The pool identifier
        pool: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The factory failed to open a connection.
    #[error("failed to open a connection for pool '{pool}': {source}")]
    Connection {
        /// The pool identifier
        pool: String,
        /// The factory's error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Pool bookkeeping no longer adds up. Never retried.
    #[error(
        "pool invariant violated: idle ({idle}) + in_use ({in_use}) + unhealthy ({unhealthy}) != total ({total})"
    )]
    InvariantViolation {
        /// Idle connections counted
        idle: usize,
        /// Checked-out connections counted
        in_use: usize,
        /// Connections counted as unhealthy
        unhealthy: usize,
        /// Connections actually tracked
        total: usize,
    },

    /// The pool has been shut down.
    #[error("pool '{pool}' is shut down")]
    Closed {
        /// The pool identifier
        pool: String,
    },

    /// The pool configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Shorthand for [`PoolError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn connection(
        pool: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            pool: pool.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn closed(pool: impl Into<String>) -> Self {
        Self::Closed { pool: pool.into() }
    }

    /// Whether waiting and trying again could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. } | Self::AcquireTimeout { .. } | Self::Connection { .. }
        )
    }
}

impl Classify for PoolError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Exhausted { .. } | Self::AcquireTimeout { .. } => FailureKind::Exhausted,
            Self::Connection { .. } => FailureKind::Connection,
            Self::InvariantViolation { .. } => FailureKind::Fatal,
            Self::Closed { .. } | Self::Configuration(_) => FailureKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PoolError::Exhausted { pool: "db".into(), max_size: 4 }, FailureKind::Exhausted)]
    #[case(
        PoolError::AcquireTimeout { pool: "db".into(), waited: Duration::from_millis(50) },
        FailureKind::Exhausted
    )]
    #[case(PoolError::connection("db", std::io::Error::other("refused")), FailureKind::Connection)]
    #[case(
        PoolError::InvariantViolation { idle: 1, in_use: 1, unhealthy: 0, total: 3 },
        FailureKind::Fatal
    )]
    #[case(PoolError::closed("db"), FailureKind::Permanent)]
    #[case(PoolError::configuration("bad"), FailureKind::Permanent)]
    fn classification(#[case] error: PoolError, #[case] expected: FailureKind) {
        assert_eq!(error.failure_kind(), expected);
    }

    #[test]
    fn connection_error_keeps_source() {
        let err = PoolError::connection("db", std::io::Error::other("refused"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("refused"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn invariant_violation_is_not_retryable() {
        let err = PoolError::InvariantViolation {
            idle: 2,
            in_use: 1,
            unhealthy: 0,
            total: 4,
        };
        assert!(!err.is_retryable());
        assert!(err.failure_kind().is_fatal());
        assert!(err.to_string().contains("!= total (4)"));
    }
}
