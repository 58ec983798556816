//! squall: resilient message consumption with dead-letter routing.
//!
//! This library provides per-topic concurrent fetch loops over a
//! partitioned, offset-addressed broker (Kafka), with manual offset commit,
//! bounded exponential-backoff retry, and a dead-letter path that preserves
//! trace context and failure metadata.
//!
//! # Example
//!
//! ```ignore
//! use squall::{Config, ConsumerManager, Envelope, KafkaBroker, Publisher, RecordHandler};
//! use std::sync::Arc;
//!
//! struct OrderHandler;
//!
//! #[async_trait::async_trait]
//! impl RecordHandler for OrderHandler {
//!     async fn process(&self, envelope: &Envelope) -> Result<(), squall::ProcessError> {
//!         // ... handle the record ...
//!         envelope.commit().await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), squall::BrokerError> {
//!     let config = Config::from_file("config.yaml")?;
//!     let broker = KafkaBroker::connect(&config)?;
//!     let publisher = Arc::new(Publisher::new(broker.sink(), &config));
//!     let manager = ConsumerManager::new(broker.open_streams()?, publisher, &config);
//!     manager.run(Arc::new(OrderHandler)).await
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod headers;
pub mod metrics;
pub mod publisher;

// Re-export main types
pub use backoff::BackoffPolicy;
pub use broker::kafka::KafkaBroker;
pub use broker::{FetchedRecord, MessageSink, OutgoingRecord, TopicStream};
pub use config::Config;
pub use consumer::{ConsumerManager, Envelope, ProcessError, RecordHandler};
pub use error::{BrokerError, ConfigError, FetchError, PublishError, SendError};
pub use event::{Event, EventType};
pub use headers::Headers;
pub use publisher::Publisher;
