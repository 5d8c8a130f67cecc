//! Error types shared by every resilience policy.
//!
//! Expected failure modes (timeouts, rejections, exhausted retries) are plain
//! values. Policies never panic on them and never swallow an error they did
//! not produce, so stacking policies keeps the original failure reachable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure, used to decide whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A deadline elapsed before the operation finished.
    Timeout,
    /// A concurrency limiter refused to admit the call.
    Rejected,
    /// A capacity limit was reached (pool exhausted, acquire wait elapsed).
    Exhausted,
    /// Connecting to, or talking to, the backend failed.
    Connection,
    /// Any other failure that is expected to go away on its own.
    Transient,
    /// A failure that will happen again no matter how often it is retried.
    Permanent,
    /// A broken internal invariant. Never retried, never absorbed.
    Fatal,
}

impl FailureKind {
    /// Returns `true` for [`FailureKind::Fatal`].
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
            Self::Connection => "connection",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Errors that know which [`FailureKind`] they belong to.
///
/// Implement this for domain errors so that [`Retry`](crate::Retry) can decide
/// whether an attempt is worth repeating.
///
/// ```
/// use keel_resilience::{Classify, FailureKind};
///
/// #[derive(Debug, thiserror::Error)]
/// enum QueryError {
///     #[error("connection reset")]
///     Reset,
///     #[error("syntax error")]
///     Syntax,
/// }
///
/// impl Classify for QueryError {
///     fn failure_kind(&self) -> FailureKind {
///         match self {
///             Self::Reset => FailureKind::Connection,
///             Self::Syntax => FailureKind::Permanent,
///         }
///     }
/// }
///
/// assert_eq!(QueryError::Reset.failure_kind(), FailureKind::Connection);
/// ```
pub trait Classify {
    /// The kind of this failure.
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        use std::io::ErrorKind::{
            ConnectionAborted, ConnectionRefused, ConnectionReset, Interrupted, NotConnected,
            TimedOut, WouldBlock,
        };
        match self.kind() {
            TimedOut => FailureKind::Timeout,
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected => {
                FailureKind::Connection
            }
            Interrupted | WouldBlock => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

/// A policy configuration that cannot be honoured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result of validating a policy configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// The deadline of a [`TimeoutGuard`](crate::TimeoutGuard) elapsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (after {duration:?})")]
pub struct TimeoutError {
    /// The deadline that was exceeded.
    pub duration: Duration,
    /// Human-readable description supplied by the caller.
    pub message: String,
}

impl TimeoutError {
    /// Create a timeout error.
    pub fn new(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            duration,
            message: message.into(),
        }
    }
}

/// A [`Bulkhead`](crate::Bulkhead) refused to run an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bulkhead '{bulkhead}' rejected call: {max_concurrent} permits busy for {waited:?}")]
pub struct BulkheadRejectedError {
    /// Name of the rejecting bulkhead.
    pub bulkhead: String,
    /// Its permit count.
    pub max_concurrent: usize,
    /// How long the caller waited before being rejected.
    pub waited: Duration,
}

/// Outcome of a retry loop that did not produce a value.
///
/// `exhausted` is `true` when every allowed attempt failed with a retryable
/// error, and `false` when a non-retryable (or fatal) error stopped the loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempt(s): {error}")]
pub struct RetryError<E> {
    /// How many times the operation was invoked.
    pub attempts: u32,
    /// The error returned by the last invocation.
    #[source]
    pub error: E,
    /// Whether the attempt budget was used up.
    pub exhausted: bool,
}

impl<E> RetryError<E> {
    /// Discard the attempt count and return the last error.
    pub fn into_inner(self) -> E {
        self.error
    }
}

/// The shared error union returned by every policy's `execute`.
///
/// `E` is the caller's own error type; policies wrap it in
/// [`ResilienceError::Operation`] and add their own variants around it.
#[derive(Error, Debug)]
pub enum ResilienceError<E> {
    /// The operation exceeded its deadline.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// A bulkhead refused the call.
    #[error(transparent)]
    Rejected(#[from] BulkheadRejectedError),

    /// Every retry attempt failed.
    #[error("retries exhausted after {attempts} attempt(s)")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The failure of the final attempt.
        last_error: Box<ResilienceError<E>>,
    },

    /// The wrapped operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> ResilienceError<E> {
    /// Wrap a caller error.
    pub const fn operation(error: E) -> Self {
        Self::Operation(error)
    }

    /// Return the innermost caller error, if the failure originated there.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::RetryExhausted { last_error, .. } => last_error.into_operation(),
            Self::Timeout(_) | Self::Rejected(_) => None,
        }
    }

    /// Borrow the innermost caller error, if any.
    pub fn as_operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::RetryExhausted { last_error, .. } => last_error.as_operation(),
            Self::Timeout(_) | Self::Rejected(_) => None,
        }
    }

    /// `true` if a deadline was exceeded.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// `true` if a bulkhead rejected the call.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl<E: Classify> Classify for ResilienceError<E> {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Rejected(_) => FailureKind::Rejected,
            Self::RetryExhausted { last_error, .. } => last_error.failure_kind(),
            Self::Operation(e) => e.failure_kind(),
        }
    }
}

impl<E> From<RetryError<ResilienceError<E>>> for ResilienceError<E> {
    fn from(err: RetryError<ResilienceError<E>>) -> Self {
        if err.exhausted {
            Self::RetryExhausted {
                attempts: err.attempts,
                last_error: Box::new(err.error),
            }
        } else {
            err.error
        }
    }
}

/// Lift a `Result<T, E>` into the shared error union.
pub trait ResultExt<T, E> {
    /// Map the error into [`ResilienceError::Operation`].
    fn into_resilience(self) -> Result<T, ResilienceError<E>>;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn into_resilience(self) -> Result<T, ResilienceError<E>> {
        self.map_err(ResilienceError::Operation)
    }
}
