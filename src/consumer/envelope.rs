//! Envelope: one fetched record plus its processing capabilities.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::broker::{FetchedRecord, TopicStream};
use crate::error::{FetchError, PublishError};
use crate::headers::Headers;
use crate::publisher::Publisher;

/// In-memory representation of one fetched record, handed to the record
/// handler on every attempt.
///
/// The snapshot of the record is immutable; only `retry_count` advances
/// between attempts (and an `error` header is appended before dead-letter
/// dispatch). The commit and move-to-DLQ capabilities are bound to this
/// specific record, so the handler never touches offsets directly.
pub struct Envelope {
    pub offset: i64,
    pub partition: i32,
    pub topic: String,
    pub key: String,
    pub body: Bytes,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
    /// Attempt counter, starting at 1 for the first handler invocation.
    pub retry_count: u32,

    stream: Arc<dyn TopicStream>,
    publisher: Arc<Publisher>,
    committed: AtomicBool,
}

impl Envelope {
    pub(crate) fn new(
        record: FetchedRecord,
        stream: Arc<dyn TopicStream>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            offset: record.offset,
            partition: record.partition,
            topic: record.topic,
            key: record.key,
            body: record.payload,
            headers: record.headers,
            timestamp: record.timestamp,
            retry_count: 1,
            stream,
            publisher,
            committed: AtomicBool::new(false),
        }
    }

    /// Acknowledge this record's offset as processed.
    ///
    /// Handlers call this on success; the consumer loop calls it after a
    /// dead-letter dispatch. Idempotent: once a commit has succeeded,
    /// further calls are no-ops.
    pub async fn commit(&self) -> Result<(), FetchError> {
        if self.committed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stream.commit(self.partition, self.offset).await?;
        self.committed.store(true, Ordering::Release);
        Ok(())
    }

    /// Republish this record's current body and headers to the configured
    /// dead-letter topic.
    pub async fn move_to_dlq(&self) -> Result<(), PublishError> {
        let record = FetchedRecord {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: self.key.clone(),
            payload: self.body.clone(),
            headers: self.headers.clone(),
            timestamp: self.timestamp,
        };
        self.publisher.publish_to_dlq(&record).await
    }

    /// Deserialize the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.key)
            .field("retry_count", &self.retry_count)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
