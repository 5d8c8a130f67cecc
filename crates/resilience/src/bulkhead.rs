//! Bulkhead: bounded concurrency with a bounded wait.
//!
//! A bulkhead owns `max_concurrent` permits. A call that finds no free permit
//! waits up to `max_wait` and is then rejected without running. Rejection is a
//! function of the current load only; there is no tripped state to recover
//! from.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::error::{BulkheadRejectedError, ConfigError, ConfigResult, ResilienceError};

/// Bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Number of operations allowed to run at the same time.
    pub max_concurrent: usize,
    /// How long a caller may wait for a permit before being rejected.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(1),
        }
    }
}

impl BulkheadConfig {
    /// Check the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::validation(
                "max_concurrent must be greater than 0",
            ));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::validation(format!(
                "max_concurrent must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkheadStats {
    /// Configured permit count.
    pub max_concurrent: usize,
    /// Operations running right now.
    pub current_concurrent: usize,
    /// `max_concurrent - current_concurrent`.
    pub available_permits: usize,
    /// `current_concurrent / max_concurrent`.
    pub utilization: f64,
    /// Operations that finished with `Ok`.
    pub total_completed: u64,
    /// Operations that finished with `Err` or were cancelled mid-flight.
    pub total_failed: u64,
    /// Callers turned away without running.
    pub total_rejected: u64,
    /// `completed / (completed + failed)`, or `1.0` before any call finished.
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    current: usize,
    completed: u64,
    failed: u64,
    rejected: u64,
}

/// A named concurrency limiter.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Semaphore,
    counters: Mutex<Counters>,
}

impl Bulkhead {
    /// Create a bulkhead.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if `config` is invalid.
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::build(name.into(), config))
    }

    fn build(name: String, config: BulkheadConfig) -> Self {
        Self {
            name,
            semaphore: Semaphore::new(config.max_concurrent),
            counters: Mutex::new(Counters::default()),
            config,
        }
    }

    /// The bulkhead's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bulkhead's configuration.
    pub const fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Run `operation` under a permit, waiting up to `max_wait` for one.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run(self.config.max_wait, operation).await
    }

    /// Run `operation` only if a permit is free right now.
    pub async fn try_execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run(Duration::ZERO, operation).await
    }

    async fn run<T, E, F, Fut>(&self, max_wait: Duration, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let mut guard = self.admit(max_wait).await?;
        let result = operation().await;
        guard.succeeded = result.is_ok();
        drop(guard);
        result
    }

    async fn admit(&self, max_wait: Duration) -> Result<Execution<'_>, BulkheadRejectedError> {
        let started = Instant::now();
        let permit = if max_wait.is_zero() {
            self.semaphore.try_acquire().ok()
        } else {
            match tokio::time::timeout(max_wait, self.semaphore.acquire()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) | Err(_) => None,
            }
        };

        let mut counters = self.counters.lock();
        match permit {
            Some(permit) => {
                counters.current += 1;
                debug!(bulkhead = %self.name, current = counters.current, "permit acquired");
                Ok(Execution {
                    bulkhead: self,
                    permit: Some(permit),
                    succeeded: false,
                })
            }
            None => {
                counters.rejected += 1;
                let waited = started.elapsed();
                warn!(
                    bulkhead = %self.name,
                    max_concurrent = self.config.max_concurrent,
                    waited_ms = waited.as_millis() as u64,
                    "bulkhead full, rejecting call"
                );
                Err(BulkheadRejectedError {
                    bulkhead: self.name.clone(),
                    max_concurrent: self.config.max_concurrent,
                    waited,
                })
            }
        }
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        let counters = self.counters.lock();
        let max = self.config.max_concurrent;
        let finished = counters.completed + counters.failed;
        BulkheadStats {
            max_concurrent: max,
            current_concurrent: counters.current,
            available_permits: max.saturating_sub(counters.current),
            utilization: counters.current as f64 / max as f64,
            total_completed: counters.completed,
            total_failed: counters.failed,
            total_rejected: counters.rejected,
            success_rate: if finished == 0 {
                1.0
            } else {
                counters.completed as f64 / finished as f64
            },
        }
    }
}

/// One admitted call. Dropping it, including through cancellation, records
/// the outcome and frees the permit in the same critical section.
struct Execution<'a> {
    bulkhead: &'a Bulkhead,
    permit: Option<SemaphorePermit<'a>>,
    succeeded: bool,
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        let mut counters = self.bulkhead.counters.lock();
        counters.current = counters.current.saturating_sub(1);
        if self.succeeded {
            counters.completed += 1;
        } else {
            counters.failed += 1;
        }
        drop(self.permit.take());
    }
}

/// Named, lazily created bulkheads shared across call sites.
///
/// The registry is an ordinary value: create one per application context and
/// hand it to whoever needs isolation units.
#[derive(Debug, Default)]
pub struct BulkheadRegistry {
    default_config: BulkheadConfig,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    /// Create a registry whose bulkheads use `default_config` unless told otherwise.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if `default_config` is invalid.
    pub fn new(default_config: BulkheadConfig) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            bulkheads: DashMap::new(),
        })
    }

    /// Return the bulkhead called `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<Bulkhead> {
        if let Some(existing) = self.bulkheads.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.bulkheads.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(Bulkhead::build(name.to_owned(), self.default_config.clone()))
        });
        Arc::clone(entry.value())
    }

    /// Return the bulkhead called `name`, creating it with `config` if absent.
    ///
    /// An existing bulkhead is returned unchanged; `config` only applies on
    /// first creation.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the bulkhead has to be created and
    /// `config` is invalid.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: BulkheadConfig,
    ) -> ConfigResult<Arc<Bulkhead>> {
        if let Some(existing) = self.bulkheads.get(name) {
            return Ok(Arc::clone(existing.value()));
        }
        let created = Arc::new(Bulkhead::new(name, config)?);
        let entry = self
            .bulkheads
            .entry(name.to_owned())
            .or_insert_with(|| created);
        Ok(Arc::clone(entry.value()))
    }

    /// Look up an existing bulkhead.
    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Remove a bulkhead. Holders of the `Arc` keep using it.
    pub fn remove(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.remove(name).map(|(_, b)| b)
    }

    /// Names of all registered bulkheads, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.bulkheads.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stats for every registered bulkhead, sorted by name.
    pub fn stats(&self) -> Vec<(String, BulkheadStats)> {
        let mut stats: Vec<_> = self
            .bulkheads
            .iter()
            .map(|e| (e.key().clone(), e.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}
