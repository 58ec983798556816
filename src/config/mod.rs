//! Configuration parsing and validation.
//!
//! Handles loading configuration from YAML files with environment variable
//! interpolation, and validates the broker surface before any connection is
//! attempted.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::{
    ConfigError, EmptyBrokersSnafu, EmptyDlqTopicSnafu, EmptyGroupIdSnafu, EmptyServiceNameSnafu,
    EmptyTopicsSnafu, EnvInterpolationSnafu, ReadFileSnafu, YamlParseSnafu,
};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    /// Consumer tuning (optional).
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Publisher tuning (optional).
    #[serde(default)]
    pub publisher: PublisherConfig,
    /// Retry backoff policy (optional).
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

/// Broker connection and topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker endpoints, e.g. `["localhost:9092"]`.
    pub brokers: Vec<String>,

    /// Consumer group identifier.
    pub group_id: String,

    /// Topics to subscribe to. One independent fetch loop runs per topic.
    pub topics: Vec<String>,

    /// Topic receiving records that exhausted their retry budget.
    pub dlq_topic: String,

    /// Name of this service, attached as the `origin` header on every
    /// published record.
    pub service_name: String,

    /// Whether missing topics may be created automatically on first use
    /// (default: false).
    #[serde(default)]
    pub auto_create_topics: bool,

    /// Replication factor used for provisioning-time topic creation
    /// (default: 1).
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

/// Consumer loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum handler retries before a record is dead-lettered (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-fetch byte ceiling, bounding memory per poll (default: 10 MB).
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,

    /// Broker connect timeout in seconds (default: 3).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            fetch_max_bytes: default_fetch_max_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ConsumerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Publisher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Per-attempt send timeout in seconds (default: 10).
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Fixed delay between transient-error retries in milliseconds
    /// (default: 250).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Total send attempts per publish, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl PublisherConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_replication_factor() -> i32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_fetch_max_bytes() -> usize {
    10 * MB
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    3
}

impl Config {
    /// Load configuration from a YAML file, interpolating environment
    /// variables before parsing.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = vars::interpolate(raw);
        ensure!(
            interpolated.is_ok(),
            EnvInterpolationSnafu {
                message: interpolated.errors.join("\n"),
            }
        );

        let config: Config =
            serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.broker.brokers.is_empty(), EmptyBrokersSnafu);
        ensure!(!self.broker.group_id.is_empty(), EmptyGroupIdSnafu);
        ensure!(!self.broker.topics.is_empty(), EmptyTopicsSnafu);
        ensure!(!self.broker.dlq_topic.is_empty(), EmptyDlqTopicSnafu);
        ensure!(!self.broker.service_name.is_empty(), EmptyServiceNameSnafu);
        Ok(())
    }
}
