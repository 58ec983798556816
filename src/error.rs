//! Error types for squall using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;
use std::time::Duration;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Broker endpoint list is empty.
    #[snafu(display("Broker list cannot be empty"))]
    EmptyBrokers,

    /// Consumer group identifier is empty.
    #[snafu(display("Consumer group id cannot be empty"))]
    EmptyGroupId,

    /// No topics are subscribed.
    #[snafu(display("Topic list cannot be empty"))]
    EmptyTopics,

    /// Dead-letter topic name is empty.
    #[snafu(display("Dead-letter topic cannot be empty"))]
    EmptyDlqTopic,

    /// Service name (origin header) is empty.
    #[snafu(display("Service name cannot be empty"))]
    EmptyServiceName,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Fetch Errors ============

/// Errors that can occur while fetching or committing records on a topic
/// stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// The stream reached a clean end. Terminates the topic loop without
    /// being treated as a failure.
    #[snafu(display("End of stream"))]
    EndOfStream,

    /// The fetch handle was closed, typically during shutdown.
    #[snafu(display("Stream closed"))]
    Closed,

    /// Transient broker failure while fetching. The topic loop logs this
    /// and keeps polling.
    #[snafu(display("Fetch failed"))]
    Fetch { source: rdkafka::error::KafkaError },

    /// Offset commit failed.
    #[snafu(display("Offset commit failed"))]
    Commit { source: rdkafka::error::KafkaError },
}

impl FetchError {
    /// True for conditions that end the topic loop rather than being
    /// retried in place.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchError::EndOfStream | FetchError::Closed)
    }
}

// ============ Send Errors ============

/// Errors surfaced by a message sink when delivering a single record.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SendError {
    /// The partition leader was unavailable. Transient; worth retrying
    /// after a short delay.
    #[snafu(display("Partition leader unavailable"))]
    LeaderUnavailable,

    /// The send did not complete within its deadline. Transient.
    #[snafu(display("Send timed out after {timeout:?}"))]
    Timeout { timeout: Duration },

    /// The broker rejected the message for a non-transient reason.
    #[snafu(display("Broker rejected message"))]
    Rejected { source: rdkafka::error::KafkaError },
}

impl SendError {
    /// Check whether this error class is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SendError::LeaderUnavailable | SendError::Timeout { .. }
        )
    }
}

// ============ Publish Errors ============

/// Errors returned by the publisher. Distinguishes configuration mistakes
/// (empty topic, unserializable payload) from delivery failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PublishError {
    /// Target topic name is empty. No network call is made.
    #[snafu(display("Topic name must not be empty"))]
    EmptyTopic,

    /// Payload could not be serialized. No network call is made.
    #[snafu(display("Failed to serialize payload"))]
    Marshal { source: serde_json::Error },

    /// Delivery failed after exhausting the publisher's retry budget (or
    /// immediately, for non-transient errors).
    #[snafu(display("Delivery failed"))]
    Delivery { source: SendError },
}

impl PublishError {
    /// True for errors caused by the caller rather than the broker.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PublishError::EmptyTopic | PublishError::Marshal { .. }
        )
    }
}

// ============ Admin Errors ============

/// Errors that can occur during provisioning-time topic administration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AdminError {
    /// Failed to build the admin client.
    #[snafu(display("Failed to create admin client"))]
    AdminClient { source: rdkafka::error::KafkaError },

    /// Topic creation request failed outright.
    #[snafu(display("Topic creation failed"))]
    TopicCreate { source: rdkafka::error::KafkaError },

    /// The broker rejected creation of a specific topic.
    #[snafu(display("Topic creation rejected for {topic}: {code}"))]
    TopicRejected {
        topic: String,
        code: rdkafka::types::RDKafkaErrorCode,
    },

    /// Cluster metadata could not be fetched.
    #[snafu(display("Failed to fetch cluster metadata"))]
    Metadata { source: rdkafka::error::KafkaError },
}

// ============ Broker Error (top-level) ============

/// Top-level errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BrokerError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Failed to connect to the broker.
    #[snafu(display("Failed to connect to broker"))]
    Connect { source: rdkafka::error::KafkaError },

    /// Publish error.
    #[snafu(display("Publish error"))]
    Publish { source: PublishError },

    /// Admin error.
    #[snafu(display("Admin error"))]
    Admin { source: AdminError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },
}
