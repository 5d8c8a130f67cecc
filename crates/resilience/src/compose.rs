//! Layering timeout, bulkhead and retry around one operation.
//!
//! The policies compose by plain nesting, since each `execute` takes and
//! returns `Result<_, ResilienceError<E>>`. [`Pipeline`] packages the two
//! common orderings:
//!
//! - [`Layout::DeadlineOutside`]: `Timeout(Bulkhead(Retry(op)))`. The deadline
//!   covers the whole call, including time spent queued for a permit and
//!   every retry delay.
//! - [`Layout::BulkheadOutside`]: `Bulkhead(Timeout(Retry(op)))`. The deadline
//!   starts only once a permit is held, so queueing is bounded by the
//!   bulkhead's `max_wait` and not by the deadline.
//! - [`Layout::DeadlinePerAttempt`]: `Bulkhead(Retry(Timeout(op)))`. Each
//!   attempt gets its own deadline, and an attempt that overruns it counts as
//!   a [`FailureKind::Timeout`](crate::FailureKind::Timeout) failure that the
//!   retry may repeat. Nothing bounds the total latency of the call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::bulkhead::Bulkhead;
use crate::error::{Classify, ResilienceError};
use crate::retry::{Backoff, BackoffPolicy, Retry};
use crate::timeout::{TimeoutConfig, TimeoutGuard};

/// Order in which a [`Pipeline`] nests its policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Layout {
    /// `Timeout(Bulkhead(Retry(op)))`
    #[default]
    DeadlineOutside,
    /// `Bulkhead(Timeout(Retry(op)))`
    BulkheadOutside,
    /// `Bulkhead(Retry(Timeout(op)))`
    DeadlinePerAttempt,
}

/// A fixed stack of optional policies.
#[derive(Debug, Clone)]
pub struct Pipeline<B = Backoff> {
    timeout: Option<TimeoutGuard>,
    bulkhead: Option<Arc<Bulkhead>>,
    retry: Option<Retry<B>>,
    layout: Layout,
}

impl Pipeline<Backoff> {
    /// Start building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder<Backoff> {
        PipelineBuilder {
            timeout: None,
            bulkhead: None,
            retry: None,
            layout: Layout::default(),
        }
    }
}

impl<B: BackoffPolicy> Pipeline<B> {
    /// The configured layout.
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    /// Run `operation` through every configured policy.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + fmt::Display,
    {
        match self.layout {
            Layout::DeadlineOutside => {
                self.deadline(|| self.isolate(|| self.retried(&mut operation)))
                    .await
            }
            Layout::BulkheadOutside => {
                self.isolate(|| self.deadline(|| self.retried(&mut operation)))
                    .await
            }
            Layout::DeadlinePerAttempt => {
                self.isolate(|| self.retried_each_bounded(&mut operation))
                    .await
            }
        }
    }

    async fn deadline<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match &self.timeout {
            Some(guard) => guard.execute(operation).await,
            None => operation().await,
        }
    }

    async fn isolate<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match &self.bulkhead {
            Some(bulkhead) => bulkhead.execute(operation).await,
            None => operation().await,
        }
    }

    async fn retried_each_bounded<T, E, F, Fut>(
        &self,
        operation: &mut F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + fmt::Display,
    {
        let guard = self.timeout.as_ref();
        let mut attempt = move || {
            let call = operation();
            async move {
                match guard {
                    Some(guard) => guard.execute(|| call).await,
                    None => call.await,
                }
            }
        };
        match &self.retry {
            Some(retry) => retry.execute(attempt).await.map_err(Into::into),
            None => attempt().await,
        }
    }

    async fn retried<T, E, F, Fut>(&self, operation: &mut F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + fmt::Display,
    {
        match &self.retry {
            Some(retry) => retry.execute(|| operation()).await.map_err(Into::into),
            None => operation().await,
        }
    }
}

/// Builder for [`Pipeline`].
#[derive(Debug)]
pub struct PipelineBuilder<B> {
    timeout: Option<TimeoutGuard>,
    bulkhead: Option<Arc<Bulkhead>>,
    retry: Option<Retry<B>>,
    layout: Layout,
}

impl<B> PipelineBuilder<B> {
    /// Add a deadline.
    #[must_use]
    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(TimeoutGuard::new(config));
        self
    }

    /// Add a shared bulkhead.
    #[must_use]
    pub fn bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Add retries.
    #[must_use]
    pub fn retry<B2>(self, retry: Retry<B2>) -> PipelineBuilder<B2> {
        PipelineBuilder {
            timeout: self.timeout,
            bulkhead: self.bulkhead,
            retry: Some(retry),
            layout: self.layout,
        }
    }

    /// Choose the nesting order.
    #[must_use]
    pub const fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Finish the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline<B> {
        Pipeline {
            timeout: self.timeout,
            bulkhead: self.bulkhead,
            retry: self.retry,
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::BulkheadConfig;
    use crate::error::FailureKind;
    use crate::retry::FixedDelay;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("flaky")]
    struct Flaky;

    impl Classify for Flaky {
        fn failure_kind(&self) -> FailureKind {
            FailureKind::Transient
        }
    }

    type Res<T> = Result<T, ResilienceError<Flaky>>;

    fn single_permit() -> Arc<Bulkhead> {
        Arc::new(
            Bulkhead::new(
                "single",
                BulkheadConfig {
                    max_concurrent: 1,
                    max_wait: Duration::from_secs(2),
                },
            )
            .unwrap(),
        )
    }

    async fn occupy(bulkhead: Arc<Bulkhead>, hold: Duration) {
        let _: Res<()> = bulkhead
            .execute(|| async move {
                tokio::time::sleep(hold).await;
                Ok(())
            })
            .await;
    }

    #[tokio::test]
    async fn empty_pipeline_runs_operation() {
        let pipeline = Pipeline::builder().build();
        let res: Res<u8> = pipeline.execute(|| async { Ok(3) }).await;
        assert_eq!(res.unwrap(), 3);
    }

    #[tokio::test]
    async fn retries_inside_the_deadline() {
        let calls = AtomicU32::new(0);
        let pipeline = Pipeline::builder()
            .timeout(TimeoutConfig::new(Duration::from_secs(1)))
            .retry(Retry::new(FixedDelay::new(Duration::from_millis(5)), 3))
            .build();

        let res: Res<&str> = pipeline
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ResilienceError::Operation(Flaky))
                    } else {
                        Ok("second time lucky")
                    }
                }
            })
            .await;

        assert_eq!(res.unwrap(), "second time lucky");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_attempt_count() {
        let pipeline = Pipeline::builder()
            .retry(Retry::new(FixedDelay::new(Duration::from_millis(1)), 3))
            .build();

        let res: Res<()> = pipeline
            .execute(|| async { Err(ResilienceError::Operation(Flaky)) })
            .await;

        match res {
            Err(ResilienceError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_outside_counts_queueing_time() {
        let bulkhead = single_permit();
        let holder = tokio::spawn(occupy(Arc::clone(&bulkhead), Duration::from_millis(200)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pipeline = Pipeline::builder()
            .timeout(TimeoutConfig::new(Duration::from_millis(80)))
            .bulkhead(Arc::clone(&bulkhead))
            .layout(Layout::DeadlineOutside)
            .build();
        let res: Res<()> = pipeline.execute(|| async { Ok(()) }).await;

        assert!(res.unwrap_err().is_timeout());
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_per_attempt_retries_a_slow_attempt() {
        let calls = AtomicU32::new(0);
        let pipeline = Pipeline::builder()
            .timeout(TimeoutConfig::new(Duration::from_millis(40)))
            .bulkhead(single_permit())
            .retry(Retry::new(FixedDelay::new(Duration::from_millis(1)), 3))
            .layout(Layout::DeadlinePerAttempt)
            .build();

        let res: Res<&str> = pipeline
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Ok("fast second attempt")
                }
            })
            .await;

        assert_eq!(res.unwrap(), "fast second attempt");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deadline_per_attempt_exhausts_on_repeated_overruns() {
        let pipeline = Pipeline::builder()
            .timeout(TimeoutConfig::new(Duration::from_millis(10)))
            .retry(Retry::new(FixedDelay::new(Duration::from_millis(1)), 2))
            .layout(Layout::DeadlinePerAttempt)
            .build();

        let res: Res<()> = pipeline
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;

        match res {
            Err(ResilienceError::RetryExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.is_timeout());
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bulkhead_outside_starts_deadline_after_admission() {
        let bulkhead = single_permit();
        let holder = tokio::spawn(occupy(Arc::clone(&bulkhead), Duration::from_millis(150)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pipeline = Pipeline::builder()
            .timeout(TimeoutConfig::new(Duration::from_millis(80)))
            .bulkhead(Arc::clone(&bulkhead))
            .layout(Layout::BulkheadOutside)
            .build();
        let res: Res<&str> = pipeline.execute(|| async { Ok("admitted") }).await;

        assert_eq!(res.unwrap(), "admitted");
        holder.await.unwrap();
    }
}
