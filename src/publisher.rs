//! Keyed, retrying publish path and the dead-letter redirection primitive.
//!
//! Delivery is at-least-once: a retried send may duplicate a message that
//! was delivered but not acknowledged. The partition routing key is a hash
//! of the serialized payload, so identical payloads co-partition; it is not
//! a domain key and implies no cross-message ordering.

use opentelemetry::Context;
use serde::Serialize;
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{FetchedRecord, MessageSink, OutgoingRecord};
use crate::config::{Config, PublisherConfig};
use crate::emit;
use crate::error::{DeliverySnafu, EmptyTopicSnafu, MarshalSnafu, PublishError};
use crate::headers::{self, Headers, ORIGIN_HEADER};
use crate::metrics::events::{MessagePublished, PublishRetried};

/// Publishes records to arbitrary topics with bounded retry, and redirects
/// exhausted records to the dead-letter topic.
///
/// Safe to share across consumer loops and application tasks.
pub struct Publisher {
    sink: Arc<dyn MessageSink>,
    origin: String,
    dlq_topic: String,
    max_attempts: u32,
    send_timeout: Duration,
    retry_delay: Duration,
}

impl Publisher {
    pub fn new(sink: Arc<dyn MessageSink>, config: &Config) -> Self {
        Self::with_tuning(
            sink,
            &config.broker.service_name,
            &config.broker.dlq_topic,
            &config.publisher,
        )
    }

    pub fn with_tuning(
        sink: Arc<dyn MessageSink>,
        origin: &str,
        dlq_topic: &str,
        tuning: &PublisherConfig,
    ) -> Self {
        Self {
            sink,
            origin: origin.to_string(),
            dlq_topic: dlq_topic.to_string(),
            max_attempts: tuning.max_attempts.max(1),
            send_timeout: tuning.send_timeout(),
            retry_delay: tuning.retry_delay(),
        }
    }

    /// The configured dead-letter topic.
    pub fn dlq_topic(&self) -> &str {
        &self.dlq_topic
    }

    /// Serialize `payload` as JSON and deliver it to `topic`.
    ///
    /// Transient send failures (leader unavailable, deadline exceeded) are
    /// retried with a fixed short delay; any other failure aborts
    /// immediately. If every attempt fails the last transient error is
    /// returned unmodified.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), PublishError> {
        let record = self.build_record(topic, payload, Headers::new())?;
        self.send_with_retry(record).await
    }

    /// Like [`publish`](Self::publish), additionally serializing the given
    /// trace context into the record headers so downstream consumers can
    /// link their spans to the originating request.
    pub async fn publish_with_trace<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        context: &Context,
    ) -> Result<(), PublishError> {
        let mut carrier = Headers::new();
        headers::inject_context(context, &mut carrier);
        let record = self.build_record(topic, payload, carrier)?;
        self.send_with_retry(record).await
    }

    /// Redirect a fetched record to the dead-letter topic.
    ///
    /// Key, body and headers are preserved; an `origin` header is appended
    /// and the destination topic is rewritten. A single unretried send; the
    /// caller decides whether a failure is fatal.
    pub async fn publish_to_dlq(&self, record: &FetchedRecord) -> Result<(), PublishError> {
        ensure!(!record.topic.is_empty(), EmptyTopicSnafu);

        let mut headers = record.headers.clone();
        headers.insert(ORIGIN_HEADER, &self.origin);

        let outgoing = OutgoingRecord {
            topic: self.dlq_topic.clone(),
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers,
        };

        debug!(
            from = %record.topic,
            to = %self.dlq_topic,
            key = %record.key,
            "Redirecting record to dead-letter topic"
        );
        self.sink
            .send(outgoing, self.send_timeout)
            .await
            .context(DeliverySnafu)
    }

    fn build_record<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        mut headers: Headers,
    ) -> Result<OutgoingRecord, PublishError> {
        ensure!(!topic.is_empty(), EmptyTopicSnafu);

        let payload = serde_json::to_vec(payload).context(MarshalSnafu)?;
        headers.insert(ORIGIN_HEADER, &self.origin);

        Ok(OutgoingRecord {
            topic: topic.to_string(),
            key: content_key(&payload),
            payload: payload.into(),
            headers,
        })
    }

    async fn send_with_retry(&self, record: OutgoingRecord) -> Result<(), PublishError> {
        let topic = record.topic.clone();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.send(record.clone(), self.send_timeout).await {
                Ok(()) => {
                    emit!(MessagePublished {
                        topic: topic.clone()
                    });
                    return Ok(());
                }
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        topic = %topic,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Transient publish failure, will retry"
                    );
                    emit!(PublishRetried {
                        topic: topic.clone()
                    });
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => return Err(error).context(DeliverySnafu),
            }
        }
    }
}

/// Partition routing key derived from the serialized payload.
fn content_key(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
