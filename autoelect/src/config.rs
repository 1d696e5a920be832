//! Election timing and lock layout settings.
//!
//! Defaults mirror what a small cluster sharing one etcd or redis deployment
//! would run with. Every value can be overridden through [`ConfigBuilder`].

use std::time::Duration;

use crate::error::{ElectError, Result};

/// How long a held lock (etcd lease or redis key expiry) stays valid without renewal.
pub const DEFAULT_TENANCY: Duration = Duration::from_secs(5);

/// Delay between two ticks of the control loop.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Delay applied after a backend error before the next tick.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Age after which a TTL-key lock record without a sane expiry is considered abandoned.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60);

/// Largest remaining expiry a live TTL-key lock record is expected to carry.
pub const DEFAULT_STALENESS_CEILING: Duration = Duration::from_secs(60);

/// Prefix of the lease-mutex lock path.
pub const DEFAULT_LOCK_PREFIX: &str = "/autoelect/";

#[derive(Debug, Clone)]
pub struct ElectConfig {
    pub tenancy: Duration,
    pub interval: Duration,
    pub error_backoff: Duration,
    pub staleness_threshold: Duration,
    pub staleness_ceiling: Duration,
    /// Block on the store until the lock is granted instead of polling for it.
    pub blocking_acquire: bool,
    pub lock_prefix: String,
}

impl Default for ElectConfig {
    fn default() -> Self {
        Self {
            tenancy: DEFAULT_TENANCY,
            interval: DEFAULT_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            staleness_ceiling: DEFAULT_STALENESS_CEILING,
            blocking_acquire: true,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_owned(),
        }
    }
}

impl ElectConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenancy < Duration::from_secs(1) {
            return Err(ElectError::InvalidArgument(
                "tenancy must be at least one second",
            ));
        }

        if self.interval.is_zero() {
            return Err(ElectError::InvalidArgument("interval must be non-zero"));
        }

        if self.interval >= self.tenancy {
            return Err(ElectError::InvalidArgument(
                "interval must be shorter than tenancy",
            ));
        }

        if self.error_backoff.is_zero() {
            return Err(ElectError::InvalidArgument("error backoff must be non-zero"));
        }

        if self.staleness_threshold.is_zero() || self.staleness_ceiling.is_zero() {
            return Err(ElectError::InvalidArgument(
                "staleness bounds must be non-zero",
            ));
        }

        // A live TTL-key master keeps its expiry at or under the tenancy, and
        // its record is never judged by age while the expiry stays under the
        // ceiling.
        if self.tenancy > self.staleness_ceiling {
            return Err(ElectError::InvalidArgument(
                "tenancy must not exceed the staleness ceiling",
            ));
        }

        if self.staleness_threshold < self.tenancy {
            return Err(ElectError::InvalidArgument(
                "staleness threshold must not be shorter than tenancy",
            ));
        }

        Ok(())
    }
}

/// Builder for [`ElectConfig`].
#[derive(Debug)]
pub struct ConfigBuilder {
    config: ElectConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ElectConfig::default(),
        }
    }

    pub fn tenancy(mut self, tenancy: Duration) -> Self {
        self.config.tenancy = tenancy;
        self
    }

    /// Set the tenancy in seconds, as the etcd session TTL is usually expressed.
    pub fn tenancy_secs(self, secs: u32) -> Self {
        self.tenancy(Duration::from_secs(secs.into()))
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.config.staleness_threshold = threshold;
        self
    }

    pub fn staleness_ceiling(mut self, ceiling: Duration) -> Self {
        self.config.staleness_ceiling = ceiling;
        self
    }

    pub fn blocking_acquire(mut self, blocking: bool) -> Self {
        self.config.blocking_acquire = blocking;
        self
    }

    pub fn lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.lock_prefix = prefix.into();
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ElectConfig> {
        self.config.validate()?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
