//! Pool configuration structures.

use std::{borrow::Cow, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Error;

/// Tunables of a single connection pool.
///
/// All `with_*` methods consume the value and return an updated copy, so one configuration
/// can be cloned and specialized per pool without shared mutable state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Pool name, used as a label in logs and metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<Cow<'static, str>>,
    /// Period of the maintenance pass.
    ///
    /// Zero disables periodic maintenance. Default is 15 seconds.
    #[serde(default = "PoolConfig::default_interval", with = "humantime_serde")]
    interval: Duration,
    /// Idle resources unused for longer than this are evicted.
    ///
    /// Default is 10 seconds.
    #[serde(default = "PoolConfig::default_idle_timeout", with = "humantime_serde")]
    idle_timeout: Duration,
    /// Upper bound on the number of live resources.
    ///
    /// Default is 20.
    #[serde(default = "PoolConfig::default_max_size", alias = "max")]
    max_size: usize,
    /// Number of live resources kept warm.
    ///
    /// Must be strictly less than [`Self::max_size`]. Default is 5.
    #[serde(default = "PoolConfig::default_min_size", alias = "min")]
    min_size: usize,
    /// Default time to wait for an idle resource.
    ///
    /// Default is 3 seconds.
    #[serde(
        default = "PoolConfig::default_acquire_timeout",
        alias = "timeout",
        with = "humantime_serde"
    )]
    acquire_timeout: Duration,
    /// Desired number of idle resources kept in the queue.
    ///
    /// Default is 5.
    #[serde(default = "PoolConfig::default_min_free", alias = "free")]
    min_free: usize,
    /// Idle resources are health-probed when untouched for longer than this.
    ///
    /// Default is 30 seconds.
    #[serde(
        default = "PoolConfig::default_ping_interval",
        alias = "ping",
        with = "humantime_serde"
    )]
    ping_interval: Duration,
    /// Opaque settings passed to the resource factory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra: Option<serde_json::Value>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            interval: Self::default_interval(),
            idle_timeout: Self::default_idle_timeout(),
            max_size: Self::default_max_size(),
            min_size: Self::default_min_size(),
            acquire_timeout: Self::default_acquire_timeout(),
            min_free: Self::default_min_free(),
            ping_interval: Self::default_ping_interval(),
            extra: None,
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::interval`].
    #[must_use]
    #[inline]
    fn default_interval() -> Duration {
        Duration::from_secs(15)
    }

    /// Default value for [`Self::idle_timeout`].
    #[must_use]
    #[inline]
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Default value for [`Self::max_size`].
    #[must_use]
    #[inline]
    fn default_max_size() -> usize {
        20
    }

    /// Default value for [`Self::min_size`].
    #[must_use]
    #[inline]
    fn default_min_size() -> usize {
        5
    }

    /// Default value for [`Self::acquire_timeout`].
    #[must_use]
    #[inline]
    fn default_acquire_timeout() -> Duration {
        Duration::from_secs(3)
    }

    /// Default value for [`Self::min_free`].
    #[must_use]
    #[inline]
    fn default_min_free() -> usize {
        5
    }

    /// Default value for [`Self::ping_interval`].
    #[must_use]
    #[inline]
    fn default_ping_interval() -> Duration {
        Duration::from_secs(30)
    }

    /// Create builder for loading pool configuration from external sources.
    pub fn loader() -> PoolConfigLoader {
        PoolConfigLoader::new()
    }

    /// Pool name, if set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Period of the maintenance pass. Zero means disabled.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Maximum idle time before eviction.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Upper bound on live resources.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of live resources kept warm.
    #[must_use]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Default acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Desired number of idle resources.
    #[must_use]
    pub fn min_free(&self) -> usize {
        self.min_free
    }

    /// Health probe interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Opaque factory settings.
    #[must_use]
    pub fn extra(&self) -> Option<&serde_json::Value> {
        self.extra.as_ref()
    }

    /// Set pool name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set period of the maintenance pass.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set maximum idle time before eviction.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set upper bound on live resources.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set number of live resources kept warm.
    #[must_use]
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Set default acquisition timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Set desired number of idle resources.
    #[must_use]
    pub fn with_min_free(mut self, min_free: usize) -> Self {
        self.min_free = min_free;
        self
    }

    /// Set health probe interval.
    ///
    /// Zero duration is ignored and the previous value is kept.
    #[must_use]
    pub fn with_ping(mut self, ping_interval: Duration) -> Self {
        if !ping_interval.is_zero() {
            self.ping_interval = ping_interval;
        }
        self
    }

    /// Set opaque factory settings.
    #[must_use]
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if `min_size` is not less than `max_size`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_size >= self.max_size {
            return Err(Error::ConfigInvalid(format!(
                "min_size ({}) must be less than max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }

    /// Deserialize [`Self::extra`] into factory-specific configuration.
    ///
    /// Returns `Ok(None)` if no extra settings are present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if extra settings do not match the target type.
    pub fn extra_as<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        self.extra
            .as_ref()
            .map(|value| T::deserialize(value))
            .transpose()
            .map_err(|err| Error::ConfigInvalid(format!("extra settings: {err}")))
    }
}

/// Builder for loading pool configuration.
#[must_use]
pub struct PoolConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl PoolConfigLoader {
    /// Alternative method to construct a pool configuration loader.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<PoolConfig, Error> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }

    /// Add a custom object implementing [`Source`] trait as a source of pool configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of pool configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of pool configuration.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .separator("_")
                .prefix_separator("__"),
        )
    }
}

impl Default for PoolConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
