//! End-to-end tests for the consumer and publisher over in-memory
//! transports.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use squall::backoff::BackoffPolicy;
use squall::broker::{FetchedRecord, MessageSink, OutgoingRecord, TopicStream};
use squall::config::PublisherConfig;
use squall::consumer::{ConsumerManager, Envelope, ProcessError, RecordHandler};
use squall::error::{FetchError, PublishError, SendError};
use squall::headers::Headers;
use squall::publisher::Publisher;

/// Scripted topic stream: yields the queued fetch results, then a clean
/// end of stream. Commits are recorded.
struct MockStream {
    fetches: Mutex<VecDeque<Result<FetchedRecord, FetchError>>>,
    commits: Mutex<Vec<(i32, i64)>>,
}

impl MockStream {
    fn new(fetches: Vec<Result<FetchedRecord, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            fetches: Mutex::new(fetches.into()),
            commits: Mutex::new(Vec::new()),
        })
    }

    fn commits(&self) -> Vec<(i32, i64)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopicStream for MockStream {
    async fn fetch(&self) -> Result<FetchedRecord, FetchError> {
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(FetchError::EndOfStream))
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<(), FetchError> {
        self.commits.lock().unwrap().push((partition, offset));
        Ok(())
    }

    async fn close(&self) {}
}

/// Scripted sink: consumes queued failures before accepting sends.
#[derive(Default)]
struct MockSink {
    sent: Mutex<Vec<OutgoingRecord>>,
    failures: Mutex<VecDeque<SendError>>,
    attempts: AtomicUsize,
}

impl MockSink {
    fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_with(failures: Vec<SendError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into()),
            ..Self::default()
        })
    }

    fn sent(&self) -> Vec<OutgoingRecord> {
        self.sent.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for MockSink {
    async fn send(&self, record: OutgoingRecord, _timeout: Duration) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(record);
        Ok(())
    }
}

/// Handler that fails the first `fail_first` invocations, then commits.
struct ScriptedHandler {
    fail_first: u32,
    error: String,
    calls: AtomicU32,
}

impl ScriptedHandler {
    fn new(fail_first: u32, error: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            error: error.to_string(),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for ScriptedHandler {
    async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(self.error.clone().into());
        }
        envelope.commit().await?;
        Ok(())
    }
}

fn record(topic: &str, offset: i64) -> FetchedRecord {
    FetchedRecord {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: format!("key-{offset}"),
        payload: Bytes::from_static(br#"{"order_id":42}"#),
        headers: Headers::new(),
        timestamp: Utc::now(),
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_interval_ms: 1,
        multiplier: 2.0,
        max_interval_secs: 1,
        max_elapsed_secs: 60,
    }
}

fn fast_publisher(sink: Arc<MockSink>) -> Arc<Publisher> {
    let tuning = PublisherConfig {
        send_timeout_secs: 1,
        retry_delay_ms: 1,
        max_attempts: 3,
    };
    Arc::new(Publisher::with_tuning(
        sink,
        "test-service",
        "orders.dlq",
        &tuning,
    ))
}

fn topics<S: TopicStream + 'static>(
    entries: Vec<(&str, Arc<S>)>,
) -> Vec<(String, Arc<dyn TopicStream>)> {
    entries
        .into_iter()
        .map(|(name, stream)| {
            let stream: Arc<dyn TopicStream> = stream;
            (name.to_string(), stream)
        })
        .collect()
}

fn manager(
    streams: Vec<(String, Arc<dyn TopicStream>)>,
    publisher: Arc<Publisher>,
    max_retries: u32,
) -> ConsumerManager {
    ConsumerManager::with_policy(streams, publisher, max_retries, fast_backoff())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

mod consumer_tests {
    use super::*;

    #[tokio::test]
    async fn successful_handler_commits_once_without_dlq() {
        let stream = MockStream::new(vec![Ok(record("orders", 7))]);
        let sink = MockSink::accepting();
        let handler = ScriptedHandler::new(0, "");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            3,
        );
        manager.run(handler.clone()).await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(stream.commits(), vec![(0, 7)]);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn success_after_retries_skips_dlq() {
        let stream = MockStream::new(vec![Ok(record("orders", 3))]);
        let sink = MockSink::accepting();
        let handler = ScriptedHandler::new(2, "db down");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            3,
        );
        manager.run(handler.clone()).await.unwrap();

        assert_eq!(handler.calls(), 3);
        assert_eq!(stream.commits(), vec![(0, 3)]);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_then_commit() {
        init_tracing();
        // Poisoned record: the handler fails every attempt with "db down".
        let stream = MockStream::new(vec![Ok(record("orders", 7))]);
        let sink = MockSink::accepting();
        let handler = ScriptedHandler::new(u32::MAX, "db down");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            3,
        );
        manager.run(handler.clone()).await.unwrap();

        // max_retries + 1 invocations, then a terminal disposition.
        assert_eq!(handler.calls(), 4);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "orders.dlq");
        assert_eq!(sent[0].headers.get("error"), Some("db down"));
        assert_eq!(sent[0].headers.get("origin"), Some("test-service"));
        // Key and body travel unchanged.
        assert_eq!(sent[0].key, "key-7");
        assert_eq!(sent[0].payload.as_ref(), br#"{"order_id":42}"#);

        // Original offset committed exactly once, no redelivery.
        assert_eq!(stream.commits(), vec![(0, 7)]);
    }

    #[tokio::test]
    async fn dlq_failure_still_commits() {
        let stream = MockStream::new(vec![Ok(record("orders", 5))]);
        let sink = MockSink::failing_with(vec![SendError::Rejected {
            source: rdkafka::error::KafkaError::Canceled,
        }]);
        let handler = ScriptedHandler::new(u32::MAX, "db down");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            1,
        );
        manager.run(handler.clone()).await.unwrap();

        // DLQ publish failed, but the loop still commits and moves on.
        assert!(sink.sent().is_empty());
        assert_eq!(stream.commits(), vec![(0, 5)]);
    }

    #[tokio::test]
    async fn transient_fetch_error_continues_loop() {
        let stream = MockStream::new(vec![
            Err(FetchError::Fetch {
                source: rdkafka::error::KafkaError::NoMessageReceived,
            }),
            Ok(record("orders", 1)),
        ]);
        let sink = MockSink::accepting();
        let handler = ScriptedHandler::new(0, "");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            3,
        );
        manager.run(handler.clone()).await.unwrap();

        // The loop survived the fetch error and processed the next record.
        assert_eq!(handler.calls(), 1);
        assert_eq!(stream.commits(), vec![(0, 1)]);
    }

    #[tokio::test]
    async fn records_processed_in_fetch_order() {
        let stream = MockStream::new(vec![
            Ok(record("orders", 1)),
            Ok(record("orders", 2)),
            Ok(record("orders", 3)),
        ]);
        let sink = MockSink::accepting();
        let handler = ScriptedHandler::new(0, "");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            3,
        );
        manager.run(handler.clone()).await.unwrap();

        assert_eq!(stream.commits(), vec![(0, 1), (0, 2), (0, 3)]);
    }

    #[tokio::test]
    async fn one_loop_per_topic() {
        struct TopicRecorder {
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl RecordHandler for TopicRecorder {
            async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError> {
                self.seen.lock().unwrap().push(envelope.topic.clone());
                envelope.commit().await?;
                Ok(())
            }
        }

        let orders = MockStream::new(vec![Ok(record("orders", 1))]);
        let payments = MockStream::new(vec![Ok(record("payments", 9))]);
        let sink = MockSink::accepting();
        let handler = Arc::new(TopicRecorder {
            seen: Mutex::new(Vec::new()),
        });

        let manager = manager(
            topics(vec![("orders", orders.clone()), ("payments", payments.clone())]),
            fast_publisher(sink),
            3,
        );
        manager.run(handler.clone()).await.unwrap();

        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["orders", "payments"]);
        assert_eq!(orders.commits(), vec![(0, 1)]);
        assert_eq!(payments.commits(), vec![(0, 9)]);
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        struct DoubleCommitter;

        #[async_trait]
        impl RecordHandler for DoubleCommitter {
            async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError> {
                envelope.commit().await?;
                envelope.commit().await?;
                Ok(())
            }
        }

        let stream = MockStream::new(vec![Ok(record("orders", 4))]);
        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(MockSink::accepting()),
            3,
        );
        manager.run(Arc::new(DoubleCommitter)).await.unwrap();

        assert_eq!(stream.commits(), vec![(0, 4)]);
    }
}

mod publisher_tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn empty_topic_is_config_error_without_send() {
        let sink = MockSink::accepting();
        let publisher = fast_publisher(sink.clone());

        let err = publisher.publish("", &json!({"n": 1})).await.unwrap_err();
        assert!(matches!(err, PublishError::EmptyTopic));
        assert!(err.is_configuration());
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn publish_sets_origin_and_content_key() {
        let sink = MockSink::accepting();
        let publisher = fast_publisher(sink.clone());

        publisher.publish("orders", &json!({"n": 1})).await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.get("origin"), Some("test-service"));
        // SHA-256 hex digest of the serialized payload.
        assert_eq!(sent[0].key.len(), 64);
        assert!(sent[0].key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn same_payload_routes_to_same_key() {
        let sink = MockSink::accepting();
        let publisher = fast_publisher(sink.clone());

        publisher.publish("orders", &json!({"n": 1})).await.unwrap();
        publisher.publish("orders", &json!({"n": 1})).await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent[0].key, sent[1].key);
    }

    #[tokio::test]
    async fn transient_failure_retries_three_attempts_then_surfaces_error() {
        let sink = MockSink::failing_with(vec![
            SendError::LeaderUnavailable,
            SendError::LeaderUnavailable,
            SendError::LeaderUnavailable,
        ]);
        let publisher = fast_publisher(sink.clone());

        let err = publisher
            .publish("orders", &json!({"n": 1}))
            .await
            .unwrap_err();

        assert_eq!(sink.attempts(), 3);
        assert!(matches!(
            err,
            PublishError::Delivery {
                source: SendError::LeaderUnavailable
            }
        ));
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let sink = MockSink::failing_with(vec![SendError::LeaderUnavailable]);
        let publisher = fast_publisher(sink.clone());

        publisher.publish("orders", &json!({"n": 1})).await.unwrap();

        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn non_transient_failure_aborts_immediately() {
        let sink = MockSink::failing_with(vec![SendError::Rejected {
            source: rdkafka::error::KafkaError::Canceled,
        }]);
        let publisher = fast_publisher(sink.clone());

        let err = publisher
            .publish("orders", &json!({"n": 1}))
            .await
            .unwrap_err();

        assert_eq!(sink.attempts(), 1);
        assert!(matches!(
            err,
            PublishError::Delivery {
                source: SendError::Rejected { .. }
            }
        ));
    }

    #[tokio::test]
    async fn publish_with_trace_injects_traceparent() {
        use opentelemetry::Context;
        use opentelemetry::trace::{
            SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
        };

        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let context = Context::new().with_remote_span_context(span_context);

        let sink = MockSink::accepting();
        let publisher = fast_publisher(sink.clone());
        publisher
            .publish_with_trace("orders", &json!({"n": 1}), &context)
            .await
            .unwrap();

        let sent = sink.sent();
        let traceparent = sent[0].headers.get("traceparent").unwrap();
        assert!(traceparent.contains("4bf92f3577b34da6a3ce929d0e0e4736"));
        assert_eq!(sent[0].headers.get("origin"), Some("test-service"));
    }
}

mod trace_context_tests {
    use super::*;

    /// A traceparent published upstream survives the broker hop and is
    /// recoverable from the fetched record's headers.
    #[tokio::test]
    async fn consumer_sees_upstream_trace_context() {
        use opentelemetry::trace::TraceContextExt;

        let mut headers = Headers::new();
        headers.insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        );

        struct ContextAsserter;

        #[async_trait]
        impl RecordHandler for ContextAsserter {
            async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError> {
                let context = squall::headers::extract_context(&envelope.headers);
                assert!(context.span().span_context().is_valid());
                envelope.commit().await?;
                Ok(())
            }
        }

        let mut traced = record("orders", 2);
        traced.headers = headers;
        let stream = MockStream::new(vec![Ok(traced)]);

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(MockSink::accepting()),
            3,
        );
        manager.run(Arc::new(ContextAsserter)).await.unwrap();

        assert_eq!(stream.commits(), vec![(0, 2)]);
    }
}

mod shutdown_tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    /// Fetch handle whose fetch stays pending until the handle is closed.
    struct PendingStream {
        closed: CancellationToken,
        commits: Mutex<Vec<(i32, i64)>>,
    }

    impl PendingStream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: CancellationToken::new(),
                commits: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TopicStream for PendingStream {
        async fn fetch(&self) -> Result<FetchedRecord, FetchError> {
            self.closed.cancelled().await;
            Err(FetchError::Closed)
        }

        async fn commit(&self, partition: i32, offset: i64) -> Result<(), FetchError> {
            self.commits.lock().unwrap().push((partition, offset));
            Ok(())
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    #[tokio::test]
    async fn shutdown_resolves_pending_fetch_and_stops_loops() {
        init_tracing();
        let stream = PendingStream::new();
        let handler = ScriptedHandler::new(0, "");

        let manager = manager(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(MockSink::accepting()),
            3,
        );
        let handles = manager.listen(handler.clone());
        manager.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(handler.calls(), 0);
        assert!(stream.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_during_retry_wait_abandons_record_uncommitted() {
        init_tracing();
        let stream = MockStream::new(vec![Ok(record("orders", 6))]);
        let sink = MockSink::accepting();
        let handler = ScriptedHandler::new(u32::MAX, "db down");

        // Long first interval so the loop is parked in its retry wait when
        // shutdown arrives.
        let slow_backoff = BackoffPolicy {
            initial_interval_ms: 60_000,
            multiplier: 1.5,
            max_interval_secs: 60,
            max_elapsed_secs: 300,
        };
        let manager = ConsumerManager::with_policy(
            topics(vec![("orders", stream.clone())]),
            fast_publisher(sink.clone()),
            3,
            slow_backoff,
        );

        let handles = manager.listen(handler.clone());
        while handler.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        manager.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }

        // Abandoned uncommitted: the record is left for redelivery.
        assert_eq!(handler.calls(), 1);
        assert!(stream.commits().is_empty());
        assert!(sink.sent().is_empty());
    }
}

mod metrics_tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    /// Run one exhausted-retries scenario against `sink` under a local
    /// recorder and return the dead-letter counter value.
    fn dead_letters_recorded(sink: Arc<MockSink>) -> u64 {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let stream = MockStream::new(vec![Ok(record("orders", 7))]);
                let manager = manager(topics(vec![("orders", stream)]), fast_publisher(sink), 0);
                manager
                    .run(ScriptedHandler::new(u32::MAX, "db down"))
                    .await
                    .unwrap();
            })
        });

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| {
                (key.key().name() == "squall_records_dead_lettered_total").then_some(value)
            })
            .map(|value| match value {
                DebugValue::Counter(count) => count,
                _ => 0,
            })
            .unwrap_or(0)
    }

    #[test]
    fn dead_letter_counter_requires_successful_redirect() {
        assert_eq!(dead_letters_recorded(MockSink::accepting()), 1);

        let failing = MockSink::failing_with(vec![SendError::Rejected {
            source: rdkafka::error::KafkaError::Canceled,
        }]);
        assert_eq!(dead_letters_recorded(failing), 0);
    }
}
