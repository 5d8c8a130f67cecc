//! Retry with pluggable backoff.
//!
//! A [`BackoffPolicy`] answers two questions for a 1-based attempt number:
//! how long to wait before the next attempt, and whether another attempt is
//! allowed at all. [`Retry`] drives an operation through that policy and
//! reports the outcome as a value, never as a panic.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Classify, ConfigError, ConfigResult, FailureKind, RetryError};

/// Upper bound accepted for the jitter fraction.
pub const MAX_JITTER: f64 = 1.0;

/// Default jitter fraction applied when jitter is enabled.
pub const DEFAULT_JITTER: f64 = 0.1;

/// A backoff strategy.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Delay to wait after the given (1-based) failed attempt.
    fn get_delay(&self, attempt: u32) -> Duration;

    /// Whether another attempt may follow the given (1-based) failed attempt.
    fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// Short name used in log fields.
    fn name(&self) -> &'static str;
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl BackoffPolicy for NoRetry {
    fn get_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn should_retry(&self, _attempt: u32, _max_attempts: u32) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Wait the same amount of time between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    /// Create a fixed backoff.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffPolicy for FixedDelay {
    fn get_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// `delay = min(max_delay, base_delay * multiplier^(attempt - 1))`, optionally
/// perturbed by up to `±jitter` of itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    /// Doubling backoff without jitter.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Set the growth factor between consecutive delays.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, MAX_JITTER);
        self
    }

    /// The un-jittered delay for an attempt.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(self.max_delay)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn get_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
        let jittered = (delay.as_secs_f64() * (1.0 + spread))
            .clamp(0.0, self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(jittered)
            .map_or(self.max_delay, |jittered| jittered.min(self.max_delay))
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}

/// Config-driven choice among the built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// See [`NoRetry`].
    None(NoRetry),
    /// See [`FixedDelay`].
    Fixed(FixedDelay),
    /// See [`ExponentialBackoff`].
    Exponential(ExponentialBackoff),
}

impl BackoffPolicy for Backoff {
    fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::None(p) => p.get_delay(attempt),
            Self::Fixed(p) => p.get_delay(attempt),
            Self::Exponential(p) => p.get_delay(attempt),
        }
    }

    fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        match self {
            Self::None(p) => p.should_retry(attempt, max_attempts),
            Self::Fixed(p) => p.should_retry(attempt, max_attempts),
            Self::Exponential(p) => p.should_retry(attempt, max_attempts),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::None(p) => p.name(),
            Self::Fixed(p) => p.name(),
            Self::Exponential(p) => p.name(),
        }
    }
}

/// Retry configuration as loaded from an external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total invocations allowed, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub base_delay: Duration,
    /// Cap on any single delay.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Randomise delays by [`DEFAULT_JITTER`] of their value.
    pub jitter: bool,
    /// Failure kinds worth another attempt.
    pub retry_on: SmallVec<[FailureKind; 4]>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            retry_on: smallvec![
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Transient,
            ],
        }
    }
}

impl RetryConfig {
    /// Check the configuration for values the executor cannot honour.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::validation("max_attempts must be at least 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::validation(format!(
                "max_delay ({:?}) must not be smaller than base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(ConfigError::validation(format!(
                "exponential_base must be a finite number >= 1.0, got {}",
                self.exponential_base
            )));
        }
        if self.retry_on.contains(&FailureKind::Fatal) {
            return Err(ConfigError::validation(
                "fatal failures can never be retried",
            ));
        }
        Ok(())
    }

    /// The exponential backoff described by this configuration.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        let backoff = ExponentialBackoff::new(self.base_delay, self.max_delay)
            .with_multiplier(self.exponential_base);
        if self.jitter {
            backoff.with_jitter(DEFAULT_JITTER)
        } else {
            backoff
        }
    }
}

/// Drives an operation through a [`BackoffPolicy`].
///
/// Errors whose [`FailureKind`] is outside `retry_on` end the loop after the
/// attempt that produced them, without sleeping. [`FailureKind::Fatal`] always
/// ends it.
#[derive(Debug, Clone)]
pub struct Retry<B = Backoff> {
    backoff: B,
    max_attempts: u32,
    retry_on: SmallVec<[FailureKind; 4]>,
}

impl Retry<Backoff> {
    /// Build an exponential-backoff executor from configuration.
    pub fn from_config(config: &RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            backoff: Backoff::Exponential(config.backoff()),
            max_attempts: config.max_attempts,
            retry_on: config.retry_on.clone(),
        })
    }
}

impl<B: BackoffPolicy> Retry<B> {
    /// Create an executor retrying the default kinds
    /// (timeouts, connection failures, transient failures).
    #[must_use]
    pub fn new(backoff: B, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
            retry_on: RetryConfig::default().retry_on,
        }
    }

    /// Replace the set of retryable kinds. `Fatal` is dropped if present.
    #[must_use]
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_on = kinds.into_iter().filter(|k| !k.is_fatal()).collect();
        self
    }

    /// The backoff policy.
    pub const fn backoff(&self) -> &B {
        &self.backoff
    }

    /// Maximum number of invocations.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether errors of this kind are retried.
    #[must_use]
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        !kind.is_fatal() && self.retry_on.contains(&kind)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget runs out.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.execute_if(operation, |e: &E| self.is_retryable(e.failure_kind()))
            .await
    }

    /// Like [`execute`](Self::execute), but with a caller-supplied retry predicate.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, policy = self.backoff.name(), "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !is_retryable(&error) {
                        debug!(attempt, %error, "error is not retryable");
                        return Err(RetryError {
                            attempts: attempt,
                            error,
                            exhausted: false,
                        });
                    }
                    if !self.backoff.should_retry(attempt, self.max_attempts) {
                        warn!(attempts = attempt, %error, "retries exhausted");
                        return Err(RetryError {
                            attempts: attempt,
                            error,
                            exhausted: true,
                        });
                    }
                    let delay = self.backoff.get_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "attempt failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
