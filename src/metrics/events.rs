//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! counter metric through the `metrics` facade.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a record is fetched from a topic.
pub struct RecordFetched {
    pub topic: String,
}

impl InternalEvent for RecordFetched {
    fn emit(self) {
        trace!(topic = %self.topic, "Record fetched");
        counter!("squall_records_fetched_total", "topic" => self.topic).increment(1);
    }
}

/// Event emitted when a fetch attempt fails transiently.
pub struct FetchFailed {
    pub topic: String,
}

impl InternalEvent for FetchFailed {
    fn emit(self) {
        trace!(topic = %self.topic, "Fetch failed");
        counter!("squall_fetch_failures_total", "topic" => self.topic).increment(1);
    }
}

/// Event emitted when a handler failure triggers a retry.
pub struct HandlerRetried {
    pub topic: String,
    pub attempt: u32,
}

impl InternalEvent for HandlerRetried {
    fn emit(self) {
        trace!(topic = %self.topic, attempt = self.attempt, "Handler retried");
        counter!("squall_handler_retries_total", "topic" => self.topic).increment(1);
    }
}

/// Event emitted when a record is dispatched to the dead-letter topic.
pub struct RecordDeadLettered {
    pub topic: String,
}

impl InternalEvent for RecordDeadLettered {
    fn emit(self) {
        trace!(topic = %self.topic, "Record dead-lettered");
        counter!("squall_records_dead_lettered_total", "topic" => self.topic).increment(1);
    }
}

/// Event emitted when a record's offset is committed by the consumer loop.
pub struct RecordCommitted {
    pub topic: String,
}

impl InternalEvent for RecordCommitted {
    fn emit(self) {
        trace!(topic = %self.topic, "Record committed");
        counter!("squall_records_committed_total", "topic" => self.topic).increment(1);
    }
}

/// Event emitted when a message is successfully published.
pub struct MessagePublished {
    pub topic: String,
}

impl InternalEvent for MessagePublished {
    fn emit(self) {
        trace!(topic = %self.topic, "Message published");
        counter!("squall_messages_published_total", "topic" => self.topic).increment(1);
    }
}

/// Event emitted when a transient publish failure is retried.
pub struct PublishRetried {
    pub topic: String,
}

impl InternalEvent for PublishRetried {
    fn emit(self) {
        trace!(topic = %self.topic, "Publish retried");
        counter!("squall_publish_retries_total", "topic" => self.topic).increment(1);
    }
}
