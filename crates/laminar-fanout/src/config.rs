//! Processor configuration.
//!
//! Configuration can be assembled with [`FanoutConfig::builder`] or parsed
//! from a string key-value map (as handed over by a pipeline definition)
//! with [`FanoutConfig::from_properties`].
//!
//! | Key                 | Default        | Meaning                                  |
//! |---------------------|----------------|------------------------------------------|
//! | `lanes`             | CPU count      | Number of parallel lanes                 |
//! | `batch.size`        | 100            | Max markers drained per lane iteration   |
//! | `poll.timeout.ms`   | 3000           | Bounded wait for every blocking call     |
//! | `shutdown.grace.ms` | 60000          | How long `stop` waits for workers        |
//! | `name`              | `fanout`       | Label used for thread names and logs     |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FanoutError;

/// Default number of markers a lane drains per iteration.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default bounded wait used by every blocking queue and rendezvous call.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default grace period for worker shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Default diagnostic label.
pub const DEFAULT_NAME: &str = "fanout";

/// Configuration for a [`PartitionedProcessor`](crate::PartitionedProcessor).
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Number of parallel lanes (worker threads besides the coordinator).
    pub lane_count: usize,
    /// Max markers drained per lane iteration; also sizes the queues.
    pub batch_size: usize,
    /// Bounded wait for queue offers, polls and rendezvous waits.
    pub poll_timeout: Duration,
    /// How long shutdown waits for workers to exit.
    pub shutdown_grace: Duration,
    /// Label used in thread names and log spans.
    pub name: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            lane_count: num_cpus::get(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            name: DEFAULT_NAME.to_string(),
        }
    }
}

impl FanoutConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> FanoutConfigBuilder {
        FanoutConfigBuilder::default()
    }

    /// Parses a configuration from string properties.
    ///
    /// Unknown keys are ignored. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::InvalidConfig` if a value cannot be parsed or
    /// the resulting configuration is invalid.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, FanoutError> {
        let mut builder = Self::builder();
        if let Some(lanes) = parse_property::<usize>(properties, "lanes")? {
            builder = builder.lane_count(lanes);
        }
        if let Some(batch_size) = parse_property::<usize>(properties, "batch.size")? {
            builder = builder.batch_size(batch_size);
        }
        if let Some(ms) = parse_property::<u64>(properties, "poll.timeout.ms")? {
            builder = builder.poll_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_property::<u64>(properties, "shutdown.grace.ms")? {
            builder = builder.shutdown_grace(Duration::from_millis(ms));
        }
        if let Some(name) = properties.get("name") {
            builder = builder.name(name.clone());
        }
        builder.build()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.lane_count == 0 {
            return Err(FanoutError::InvalidConfig(
                "lane_count must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(FanoutError::InvalidConfig(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(FanoutError::InvalidConfig(
                "poll_timeout must be > 0".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(FanoutError::InvalidConfig(
                "name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Capacity of each lane queue.
    #[must_use]
    pub fn lane_queue_capacity(&self) -> usize {
        self.batch_size.saturating_mul(2)
    }

    /// Capacity of the coordinator's watermark queue.
    #[must_use]
    pub fn marker_queue_capacity(&self) -> usize {
        self.batch_size
    }

    /// Upper bound on markers resident across all lane queues.
    #[must_use]
    pub fn max_resident_markers(&self) -> usize {
        self.lane_count.saturating_mul(self.lane_queue_capacity())
    }

    /// Thread name for the given lane worker.
    #[must_use]
    pub fn lane_thread_name(&self, lane: usize) -> String {
        format!("{}-lane-{lane}", self.name)
    }

    /// Thread name for the checkpoint coordinator.
    #[must_use]
    pub fn coordinator_thread_name(&self) -> String {
        format!("{}-watermark", self.name)
    }
}

fn parse_property<T>(
    properties: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, FanoutError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match properties.get(key) {
        Some(v) => v.trim().parse::<T>().map(Some).map_err(|e| {
            FanoutError::InvalidConfig(format!("invalid value for '{key}': {e}"))
        }),
        None => Ok(None),
    }
}

/// Builder for `FanoutConfig`.
#[derive(Debug, Default)]
pub struct FanoutConfigBuilder {
    lane_count: Option<usize>,
    batch_size: Option<usize>,
    poll_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    name: Option<String>,
}

impl FanoutConfigBuilder {
    /// Sets the number of lanes.
    #[must_use]
    pub fn lane_count(mut self, n: usize) -> Self {
        self.lane_count = Some(n);
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    /// Sets the bounded wait for blocking operations.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Sets the diagnostic label.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<FanoutConfig, FanoutError> {
        let config = FanoutConfig {
            lane_count: self.lane_count.unwrap_or_else(num_cpus::get),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            poll_timeout: self.poll_timeout.unwrap_or(DEFAULT_POLL_TIMEOUT),
            shutdown_grace: self.shutdown_grace.unwrap_or(DEFAULT_SHUTDOWN_GRACE),
            name: self.name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}
