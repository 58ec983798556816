//! Kafka-backed broker transport using rdkafka.
//!
//! One `StreamConsumer` is opened per subscribed topic so each consumer
//! loop owns its fetch handle exclusively; a single `FutureProducer` is
//! shared by every publisher and DLQ path. Offset commits are manual.

use rand::{Rng, distributions::Alphanumeric};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{
    BorrowedMessage, Header as KafkaHeader, Headers as _, Message, OwnedHeaders,
};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{FetchedRecord, MessageSink, OutgoingRecord, TopicStream};
use crate::config::Config;
use crate::error::{
    AdminClientSnafu, AdminError, BrokerError, CommitSnafu, ConfigSnafu, ConnectSnafu, FetchError,
    MetadataSnafu, SendError, TopicCreateSnafu, TopicRejectedSnafu,
};
use crate::headers::Headers;

/// Timeout for provisioning-time admin operations.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to a Kafka cluster: shared producer plus per-topic fetch
/// handles.
pub struct KafkaBroker {
    config: Config,
    producer: FutureProducer,
}

impl KafkaBroker {
    /// Validate the configuration and connect the shared producer.
    pub fn connect(config: &Config) -> Result<Self, BrokerError> {
        config.validate().context(ConfigSnafu)?;

        let producer: FutureProducer =
            base_client_config(config).create().context(ConnectSnafu)?;
        info!("Producer created");

        Ok(Self {
            config: config.clone(),
            producer,
        })
    }

    /// The shared delivery path for outgoing records.
    pub fn sink(&self) -> Arc<dyn MessageSink> {
        Arc::new(KafkaSink {
            producer: self.producer.clone(),
        })
    }

    /// Open one fetch handle per subscribed topic.
    pub fn open_streams(&self) -> Result<Vec<(String, Arc<dyn TopicStream>)>, BrokerError> {
        let broker = &self.config.broker;
        let tuning = &self.config.consumer;

        let mut streams: Vec<(String, Arc<dyn TopicStream>)> =
            Vec::with_capacity(broker.topics.len());
        for topic in &broker.topics {
            let mut client_config = base_client_config(&self.config);
            client_config
                .set("group.id", &broker.group_id)
                .set("enable.auto.commit", "false")
                .set("socket.keepalive.enable", "true")
                .set(
                    "socket.timeout.ms",
                    (tuning.connect_timeout_secs * 1000).to_string(),
                )
                .set("fetch.message.max.bytes", tuning.fetch_max_bytes.to_string())
                .set(
                    "allow.auto.create.topics",
                    broker.auto_create_topics.to_string(),
                );

            let consumer: StreamConsumer = client_config.create().context(ConnectSnafu)?;
            consumer.subscribe(&[topic]).context(ConnectSnafu)?;
            info!(topic = %topic, group_id = %broker.group_id, "Listening");

            streams.push((
                topic.clone(),
                Arc::new(KafkaTopicStream {
                    topic: topic.clone(),
                    consumer,
                    closed: CancellationToken::new(),
                }),
            ));
        }
        Ok(streams)
    }

    /// Create a topic with the configured replication factor.
    ///
    /// Provisioning-time helper; not used by the processing loops.
    pub async fn create_topic(&self, topic: &str, partitions: i32) -> Result<(), AdminError> {
        let admin: AdminClient<DefaultClientContext> = base_client_config(&self.config)
            .create()
            .context(AdminClientSnafu)?;

        let new_topic = NewTopic::new(
            topic,
            partitions,
            TopicReplication::Fixed(self.config.broker.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = admin
            .create_topics([&new_topic], &options)
            .await
            .context(TopicCreateSnafu)?;
        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "Topic created"),
                Err((name, code)) => {
                    return TopicRejectedSnafu { topic: name, code }.fail();
                }
            }
        }
        Ok(())
    }

    /// List all topic names known to the cluster.
    pub fn list_topics(&self) -> Result<Vec<String>, AdminError> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(None, ADMIN_TIMEOUT)
            .context(MetadataSnafu)?;
        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }
}

/// Kafka fetch handle for a single topic.
struct KafkaTopicStream {
    topic: String,
    consumer: StreamConsumer,
    closed: CancellationToken,
}

#[async_trait]
impl TopicStream for KafkaTopicStream {
    async fn fetch(&self) -> Result<FetchedRecord, FetchError> {
        let message = tokio::select! {
            biased;

            _ = self.closed.cancelled() => return Err(FetchError::Closed),
            message = self.consumer.recv() => message,
        };

        match message {
            Ok(message) => Ok(record_from_message(&self.topic, &message)),
            Err(KafkaError::PartitionEOF(partition)) => {
                debug!(topic = %self.topic, partition, "Partition reached end of stream");
                Err(FetchError::EndOfStream)
            }
            Err(source) => Err(FetchError::Fetch { source }),
        }
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<(), FetchError> {
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
            .context(CommitSnafu)?;
        self.consumer
            .commit(&assignment, CommitMode::Sync)
            .context(CommitSnafu)
    }

    async fn close(&self) {
        self.closed.cancel();
        self.consumer.unsubscribe();
    }
}

/// Shared producer-backed sink.
struct KafkaSink {
    producer: FutureProducer,
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn send(&self, record: OutgoingRecord, timeout: Duration) -> Result<(), SendError> {
        let headers = to_kafka_headers(&record.headers);
        let future_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(record.payload.as_ref())
            .headers(headers);

        match self
            .producer
            .send(future_record, Timeout::After(timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((error, _)) => Err(classify_send_error(error, timeout)),
        }
    }
}

/// Build the client configuration shared by producer, consumers and admin.
fn base_client_config(config: &Config) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.broker.brokers.join(","))
        .set("client.id", client_id(&config.broker.service_name));
    client_config
}

/// Client id with a random suffix so concurrent instances of the same
/// service are distinguishable in broker logs.
fn client_id(service_name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("{service_name}-{suffix}")
}

fn record_from_message(topic: &str, message: &BorrowedMessage<'_>) -> FetchedRecord {
    let mut headers = Headers::new();
    if let Some(kafka_headers) = message.headers() {
        for header in kafka_headers.iter() {
            let value = header
                .value
                .map(|value| String::from_utf8_lossy(value).into_owned())
                .unwrap_or_default();
            headers.insert(header.key, value);
        }
    }

    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    FetchedRecord {
        topic: topic.to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_default(),
        payload: message
            .payload()
            .map(bytes::Bytes::copy_from_slice)
            .unwrap_or_default(),
        headers,
        timestamp,
    }
}

fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new(), |kafka_headers, (key, value)| {
            kafka_headers.insert(KafkaHeader {
                key,
                value: Some(value.as_bytes()),
            })
        })
}

fn classify_send_error(error: KafkaError, timeout: Duration) -> SendError {
    match error {
        KafkaError::MessageProduction(RDKafkaErrorCode::LeaderNotAvailable)
        | KafkaError::MessageProduction(RDKafkaErrorCode::NotLeaderForPartition) => {
            SendError::LeaderUnavailable
        }
        KafkaError::MessageProduction(RDKafkaErrorCode::RequestTimedOut)
        | KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut)
        | KafkaError::MessageProduction(RDKafkaErrorCode::OperationTimedOut) => {
            SendError::Timeout { timeout }
        }
        source => SendError::Rejected { source },
    }
}
