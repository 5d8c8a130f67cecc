//! Hard deadlines for async operations.
//!
//! On expiry the wrapped future is dropped, which cancels it at its next
//! suspension point. The guard owns nothing the operation acquired: anything
//! that must be given back (a pooled connection, a bulkhead permit) has to be
//! released by a drop guard inside the operation itself.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ResilienceError, TimeoutError};

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for the whole operation.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub duration: Duration,
    /// Description carried by the resulting [`TimeoutError`].
    pub message: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            message: "operation timed out".to_owned(),
        }
    }
}

impl TimeoutConfig {
    /// Config with the given deadline and the default message.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    /// Replace the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Applies a fixed deadline to operations.
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    config: TimeoutConfig,
}

impl TimeoutGuard {
    /// Create a guard.
    #[must_use]
    pub const fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// The configured deadline.
    pub const fn duration(&self) -> Duration {
        self.config.duration
    }

    /// Run `operation`, failing with [`ResilienceError::Timeout`] once the
    /// deadline passes.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match tokio::time::timeout(self.config.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    timeout_ms = self.config.duration.as_millis() as u64,
                    message = %self.config.message,
                    "deadline exceeded, operation cancelled"
                );
                Err(self.error().into())
            }
        }
    }

    fn error(&self) -> TimeoutError {
        TimeoutError::new(self.config.duration, self.config.message.clone())
    }
}

/// Await `future` for at most `duration`.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use keel_resilience::timeout;
/// use std::time::Duration;
///
/// let value = timeout(Duration::from_secs(1), async { 42 }).await.unwrap();
/// assert_eq!(value, 42);
/// # }
/// ```
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::new(duration, "operation timed out"))
}
