//! Consumer manager: one fetch-process-commit loop per subscribed topic.
//!
//! Every fetched record is either committed by the handler after successful
//! processing or, after exhausting its retry budget, republished to the
//! dead-letter topic and committed by the loop. The loop never stalls on a
//! poisoned message.
//!
//! # Commit discipline
//!
//! The manager never auto-commits successful records: the handler calls
//! [`Envelope::commit`] itself, which lets applications batch or defer
//! commits at the cost of requiring that discipline in every handler.
//!
//! # Known data-loss edge
//!
//! After retry exhaustion, failures of the dead-letter publish and of the
//! post-DLQ commit are logged and swallowed so the loop keeps moving. A
//! record whose DLQ publish failed is still committed and will not be
//! redelivered.

mod envelope;

pub use envelope::Envelope;

use async_trait::async_trait;
use futures::future::join_all;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::broker::TopicStream;
use crate::config::Config;
use crate::emit;
use crate::error::{BrokerError, TaskJoinSnafu};
use crate::headers::{self, ERROR_HEADER};
use crate::metrics::events::{
    FetchFailed, HandlerRetried, RecordCommitted, RecordDeadLettered, RecordFetched,
};
use crate::publisher::Publisher;

/// Error type returned by record handlers.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-supplied record processing logic.
///
/// Invoked once per attempt with the same [`Envelope`]. On success the
/// handler must call [`Envelope::commit`] before returning.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError>;
}

/// Runs one independent processing loop per subscribed topic.
///
/// Loops share only the publisher and the backoff policy parameters; each
/// retry sequence gets its own backoff state and each loop exclusively owns
/// its fetch handle.
pub struct ConsumerManager {
    streams: Vec<(String, Arc<dyn TopicStream>)>,
    publisher: Arc<Publisher>,
    max_retries: u32,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
}

impl ConsumerManager {
    pub fn new(
        streams: Vec<(String, Arc<dyn TopicStream>)>,
        publisher: Arc<Publisher>,
        config: &Config,
    ) -> Self {
        Self::with_policy(
            streams,
            publisher,
            config.consumer.max_retries,
            config.backoff.clone(),
        )
    }

    pub fn with_policy(
        streams: Vec<(String, Arc<dyn TopicStream>)>,
        publisher: Arc<Publisher>,
        max_retries: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            streams,
            publisher,
            max_retries,
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn one background loop per topic and return their handles.
    pub fn listen(&self, handler: Arc<dyn RecordHandler>) -> Vec<JoinHandle<()>> {
        self.streams
            .iter()
            .map(|(topic, stream)| {
                let loop_ctx = TopicLoop {
                    topic: topic.clone(),
                    stream: stream.clone(),
                    publisher: self.publisher.clone(),
                    handler: handler.clone(),
                    max_retries: self.max_retries,
                    backoff: self.backoff.clone(),
                    shutdown: self.shutdown.clone(),
                };
                tokio::spawn(loop_ctx.run())
            })
            .collect()
    }

    /// Spawn the topic loops and wait for all of them to finish.
    pub async fn run(&self, handler: Arc<dyn RecordHandler>) -> Result<(), BrokerError> {
        let handles = self.listen(handler);
        for result in join_all(handles).await {
            result.context(TaskJoinSnafu)?;
        }
        Ok(())
    }

    /// Request orderly shutdown: cancel all loops and close every fetch
    /// handle. In-flight fetches resolve with a close error that the
    /// owning loop treats as a local exit.
    pub async fn shutdown(&self) {
        info!("Shutting down consumer loops");
        self.shutdown.cancel();
        for (_, stream) in &self.streams {
            stream.close().await;
        }
    }
}

/// State owned by one topic's processing loop.
struct TopicLoop {
    topic: String,
    stream: Arc<dyn TopicStream>,
    publisher: Arc<Publisher>,
    handler: Arc<dyn RecordHandler>,
    max_retries: u32,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
}

impl TopicLoop {
    async fn run(self) {
        info!(topic = %self.topic, "Consumer loop started");

        loop {
            let fetched = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(topic = %self.topic, "Shutdown requested, stopping consumer loop");
                    break;
                }
                fetched = self.stream.fetch() => fetched,
            };

            let record = match fetched {
                Ok(record) => record,
                Err(error) if error.is_terminal() => {
                    info!(topic = %self.topic, reason = %error, "Consumer loop ended");
                    break;
                }
                Err(error) => {
                    warn!(topic = %self.topic, error = %error, "Fetch failed, continuing");
                    emit!(FetchFailed {
                        topic: self.topic.clone()
                    });
                    continue;
                }
            };

            emit!(RecordFetched {
                topic: self.topic.clone()
            });
            self.process_record(record).await;
        }
    }

    /// Drive one record through the retry state machine until it reaches a
    /// terminal disposition: committed by the handler, or dead-lettered and
    /// committed by this loop.
    async fn process_record(&self, record: crate::broker::FetchedRecord) {
        let parent_context = headers::extract_context(&record.headers);
        let mut envelope =
            Envelope::new(record, self.stream.clone(), self.publisher.clone());
        let mut backoff = self.backoff.start();

        loop {
            match self.handler.process(&envelope).await {
                Ok(()) => break,
                Err(error) => {
                    let last_error = error.to_string();

                    if envelope.retry_count > self.max_retries {
                        envelope.headers.insert(ERROR_HEADER, last_error.clone());
                        self.dead_letter(&envelope, &last_error, &parent_context)
                            .await;
                        break;
                    }

                    warn!(
                        topic = %envelope.topic,
                        key = %envelope.key,
                        attempt = envelope.retry_count,
                        max_retries = self.max_retries,
                        error = %last_error,
                        "Handler failed, will retry"
                    );
                    emit!(HandlerRetried {
                        topic: envelope.topic.clone(),
                        attempt: envelope.retry_count,
                    });

                    let delay = backoff.next_interval();
                    tokio::select! {
                        biased;

                        _ = self.shutdown.cancelled() => {
                            // Uncommitted, so the record is redelivered to
                            // the next consumer in the group.
                            warn!(
                                topic = %envelope.topic,
                                key = %envelope.key,
                                "Shutdown during retry wait, abandoning record"
                            );
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    envelope.retry_count += 1;
                }
            }
        }
    }

    /// Dead-letter dispatch: republish, then commit the original offset.
    /// Both failures are logged, never propagated, so the loop advances
    /// past the poisoned record.
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        last_error: &str,
        parent_context: &opentelemetry::Context,
    ) {
        let span = tracing::warn_span!(
            "dead_letter",
            topic = %envelope.topic,
            key = %envelope.key,
            offset = envelope.offset,
            attempts = envelope.retry_count,
        );
        {
            use tracing_opentelemetry::OpenTelemetrySpanExt;
            span.set_parent(parent_context.clone());
        }

        async {
            error!(
                topic = %envelope.topic,
                key = %envelope.key,
                error = %last_error,
                "Failed to process record, moving to dead-letter topic"
            );

            match envelope.move_to_dlq().await {
                Ok(()) => emit!(RecordDeadLettered {
                    topic: envelope.topic.clone()
                }),
                Err(error) => error!(
                    topic = %envelope.topic,
                    key = %envelope.key,
                    error = %error,
                    "Failed to move record to dead-letter topic"
                ),
            }

            if let Err(error) = envelope.commit().await {
                error!(
                    topic = %envelope.topic,
                    key = %envelope.key,
                    error = %error,
                    "Failed to commit record after dead-letter dispatch"
                );
            } else {
                emit!(RecordCommitted {
                    topic: envelope.topic.clone()
                });
            }
        }
        .instrument(span)
        .await;
    }
}
