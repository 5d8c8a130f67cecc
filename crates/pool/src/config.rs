//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Connections kept open even when nobody needs them.
    pub min_size: usize,
    /// Hard cap on open connections, idle and in use combined.
    pub max_size: usize,
    /// Idle connections above `min_size` are closed after this long unused.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_idle_time: Duration,
    /// Period of the background health check. Zero disables it.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub health_check_interval: Duration,
    /// Deadline for a single health probe; a probe that overruns fails.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub health_check_timeout: Duration,
    /// Default wait for [`Pool::acquire`](crate::Pool::acquire).
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub acquire_timeout: Duration,
    /// Connections older than this are closed instead of being handed out.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_lifetime: Duration,
    /// Attempts made to open a connection during fill and replacement.
    pub retry_attempts: u32,
    /// First backoff delay between those attempts.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub retry_base_delay: Duration,
    /// Largest backoff delay between those attempts.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub retry_max_delay: Duration,
    /// Probe a connection the caller released as healthy before reusing it.
    pub probe_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_idle_time: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            probe_on_release: false,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(PoolError::configuration("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::configuration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.max_lifetime.is_zero() {
            return Err(PoolError::configuration(
                "max_lifetime must be greater than zero",
            ));
        }
        if self.retry_attempts == 0 {
            return Err(PoolError::configuration(
                "retry_attempts must be at least 1",
            ));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(PoolError::configuration(
                "retry_max_delay must not be smaller than retry_base_delay",
            ));
        }
        let probes = !self.health_check_interval.is_zero() || self.probe_on_release;
        if probes && self.health_check_timeout.is_zero() {
            return Err(PoolError::configuration(
                "health_check_timeout must be greater than zero when connections are probed",
            ));
        }
        Ok(())
    }
}
