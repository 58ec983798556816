//! Broker transport abstraction.
//!
//! The consumer and publisher are written against two narrow traits:
//! [`TopicStream`] (topic-scoped blocking fetch with manual commit) and
//! [`MessageSink`] (keyed publish with header attachment). The Kafka-backed
//! implementations live in [`kafka`]; tests substitute in-memory ones.

pub mod kafka;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{FetchError, SendError};
use crate::headers::Headers;

/// One record fetched from a topic, before any processing.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: i32,
    /// Monotonic position within the partition.
    pub offset: i64,
    /// Partition routing key the record was published with.
    pub key: String,
    pub payload: Bytes,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

/// One record on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
    pub headers: Headers,
}

/// An open fetch handle for a single topic.
///
/// Each consumer loop exclusively owns one stream; the implementation only
/// needs to be safe for that single-loop access pattern plus a concurrent
/// `close` during shutdown.
#[async_trait]
pub trait TopicStream: Send + Sync {
    /// Await the next record.
    ///
    /// Returns [`FetchError::EndOfStream`] on a clean end and
    /// [`FetchError::Closed`] once the handle has been shut; both terminate
    /// the calling loop. Any other error is transient and the loop keeps
    /// polling.
    async fn fetch(&self) -> Result<FetchedRecord, FetchError>;

    /// Acknowledge the record at the given position as processed.
    async fn commit(&self, partition: i32, offset: i64) -> Result<(), FetchError>;

    /// Close the handle. In-flight fetches resolve with
    /// [`FetchError::Closed`].
    async fn close(&self);
}

/// A delivery path for outgoing records, shared across all publishers and
/// consumer loops.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver one record, bounded by `timeout`.
    async fn send(&self, record: OutgoingRecord, timeout: Duration) -> Result<(), SendError>;
}
