//! # Keel Resilience
//!
//! Composable policies for calls to flaky or overloaded dependencies:
//!
//! - **Retry**: repeat a fallible operation with no, fixed, or exponential
//!   (optionally jittered) backoff, retrying only classified-transient failures.
//! - **Bulkhead**: cap concurrent executions, queue briefly, then reject.
//! - **Timeout**: enforce a hard wall-clock deadline.
//! - **Pipeline**: stack the three in a documented order.
//!
//! Every policy reports expected failures as a [`ResilienceError`] value.
//! Errors classified [`FailureKind::Fatal`] pass through every policy
//! untouched.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use keel_resilience::prelude::*;
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("backend unavailable")]
//! # struct BackendError;
//! # impl Classify for BackendError {
//! #     fn failure_kind(&self) -> FailureKind { FailureKind::Connection }
//! # }
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let retry = Retry::from_config(&RetryConfig::default()).unwrap();
//!     let pipeline = Pipeline::builder()
//!         .timeout(TimeoutConfig::new(Duration::from_secs(2)))
//!         .retry(retry)
//!         .build();
//!
//!     let value = pipeline
//!         .execute(|| async { Ok::<_, ResilienceError<BackendError>>("pong") })
//!         .await
//!         .unwrap();
//!     assert_eq!(value, "pong");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bulkhead;
pub mod compose;
pub mod error;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadRegistry, BulkheadStats};
pub use compose::{Layout, Pipeline, PipelineBuilder};
pub use error::{
    BulkheadRejectedError, Classify, ConfigError, ConfigResult, FailureKind, ResilienceError,
    ResultExt, RetryError, TimeoutError,
};
pub use retry::{
    Backoff, BackoffPolicy, ExponentialBackoff, FixedDelay, NoRetry, Retry, RetryConfig,
};
pub use timeout::{TimeoutConfig, TimeoutGuard, timeout};

/// Common imports.
pub mod prelude {
    pub use crate::{
        Bulkhead, BulkheadConfig, BulkheadRegistry, Classify, FailureKind, Layout, Pipeline,
        ResilienceError, ResultExt, Retry, RetryConfig, TimeoutConfig, TimeoutGuard,
    };
}
