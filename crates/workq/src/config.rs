//! Pool and flush-cycle configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of pool units started
    pub size: usize,

    /// How long `stop` waits for units before aborting them
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            ..Default::default()
        }
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKQ_POOL_SIZE`: Number of pool units (default: 4)
    /// - `WORKQ_SHUTDOWN_TIMEOUT_MS`: Graceful stop timeout (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PoolConfig::from_env`], reading values through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let size = parse_var(&lookup, "WORKQ_POOL_SIZE")?.unwrap_or(defaults.size);
        if size == 0 {
            return Err(ConfigError::Zero("WORKQ_POOL_SIZE"));
        }

        Ok(Self {
            size,
            shutdown_timeout: parse_millis(&lookup, "WORKQ_SHUTDOWN_TIMEOUT_MS")?
                .unwrap_or(defaults.shutdown_timeout),
        })
    }
}

/// Flush cycle configuration for the batching commit worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Delay before the first flush cycle
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Delay between the end of one cycle and the start of the next
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,

    /// Maximum time one cycle spends draining the intake queue
    #[serde(with = "duration_millis")]
    pub drain_bound: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            flush_interval: Duration::from_millis(500),
            drain_bound: Duration::from_millis(250),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first cycle
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay between cycles
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the per-cycle drain bound
    pub fn with_drain_bound(mut self, bound: Duration) -> Self {
        self.drain_bound = bound;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKQ_FLUSH_INITIAL_DELAY_MS` (default: 1000)
    /// - `WORKQ_FLUSH_INTERVAL_MS` (default: 500, must be non-zero)
    /// - `WORKQ_DRAIN_BOUND_MS` (default: 250)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BatchConfig::from_env`], reading values through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let flush_interval =
            parse_millis(&lookup, "WORKQ_FLUSH_INTERVAL_MS")?.unwrap_or(defaults.flush_interval);
        if flush_interval.is_zero() {
            return Err(ConfigError::Zero("WORKQ_FLUSH_INTERVAL_MS"));
        }

        Ok(Self {
            initial_delay: parse_millis(&lookup, "WORKQ_FLUSH_INITIAL_DELAY_MS")?
                .unwrap_or(defaults.initial_delay),
            flush_interval,
            drain_bound: parse_millis(&lookup, "WORKQ_DRAIN_BOUND_MS")?
                .unwrap_or(defaults.drain_bound),
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(lookup, key)?.map(Duration::from_millis))
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
