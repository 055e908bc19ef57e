//! Redpanda broker binding for the Hive request/response shim.
//!
//! This crate implements the broker seam from `hive-shim-core` on top of
//! rdkafka, so it works against Redpanda, Apache Kafka or any other
//! Kafka-compatible cluster:
//!
//! - [`KafkaPublisher`]: a shared [`RequestPublisher`] backed by one `FutureProducer`
//! - [`KafkaConsumerFactory`]: builds one `StreamConsumer` per worker, all in
//!   the same consumer group
//! - [`KafkaConsumer`]: the per-worker [`BrokerConsumer`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  request_topic   ┌──────────────┐
//! │  RpcClient  │─────────────────►│              │
//! │ (publisher) │                  │   Redpanda   │
//! └─────────────┘                  │              │
//!        ▲                         └──────┬───────┘
//!        │ matcher                        │ response_topic
//!        │                                ▼
//! ┌──────┴───────────────────────────────────────┐
//! │ ResponseListener: worker 0 │ 1 │ ... │ N-1   │◄── one StreamConsumer each,
//! └──────────────────────────────────────────────┘    same consumer group
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with deferred offset stores:
//! - Offsets of a batch are stored only when the worker asks for the next batch,
//!   i.e. after the previous batch was handed to its handler
//! - A crash before that point redelivers the batch, which the correlation
//!   registry turns into orphans
//! - Ordering is guaranteed within a partition; the envelope's routing key
//!   picks the partition
//!
//! # Example
//!
//! ```no_run
//! use hive_shim_redpanda::{KafkaConsumerFactory, KafkaPublisher};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = KafkaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .build()?;
//!
//! let factory = KafkaConsumerFactory::new("localhost:9092", "response-consumer-group");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::FutureExt;
use hive_shim_core::{
    BrokerConsumer, BrokerError, ConsumerFactory, Delivery, Envelope, RequestPublisher,
    broker::BrokerFuture,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default producer send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound on envelopes returned by one poll.
pub const DEFAULT_MAX_BATCH: usize = 64;

/// Kafka-backed [`RequestPublisher`].
///
/// One producer is shared by every caller; rdkafka batches sends internally.
/// The envelope's [`Envelope::routing_key`] becomes the record key, so every
/// envelope of one call lands in the same partition.
///
/// # Example
///
/// ```no_run
/// use hive_shim_redpanda::KafkaPublisher;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let publisher = KafkaPublisher::new("localhost:9092")?;
///
/// // Custom configuration
/// let publisher = KafkaPublisher::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaPublisher {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create a publisher with default producer settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> KafkaPublisherBuilder {
        KafkaPublisherBuilder::default()
    }

    /// Bootstrap servers this publisher was built with.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`KafkaPublisher`].
#[derive(Default, Debug)]
pub struct KafkaPublisherBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl KafkaPublisherBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4" or "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the [`KafkaPublisher`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<KafkaPublisher, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_SEND_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            "KafkaPublisher created"
        );

        Ok(KafkaPublisher {
            producer,
            brokers,
            timeout,
        })
    }
}

impl RequestPublisher for KafkaPublisher {
    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let payload = envelope.to_bytes().map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: format!("Failed to encode envelope: {e}"),
            })?;

            let record = FutureRecord::to(topic)
                .payload(&payload)
                .key(envelope.routing_key());

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic,
                        partition,
                        offset,
                        correlation_id = %envelope.correlation_id,
                        "Envelope published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic,
                        correlation_id = %envelope.correlation_id,
                        error = %kafka_error,
                        "Failed to publish envelope"
                    );
                    Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}

/// Creates one [`KafkaConsumer`] per worker, all in the same consumer group.
///
/// Every created consumer gets its own `client.id` (`<group>-<worker_id>`) so
/// group membership is attributable per worker in broker tooling.
#[derive(Clone, Debug)]
pub struct KafkaConsumerFactory {
    brokers: String,
    group_id: String,
    auto_offset_reset: String,
    session_timeout: Duration,
    max_batch: usize,
}

impl KafkaConsumerFactory {
    /// Factory for `group_id` on the given bootstrap servers.
    ///
    /// New groups start from the latest offset: responses published before
    /// the listener came up have no pending call to resolve.
    #[must_use]
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            auto_offset_reset: "latest".to_string(),
            session_timeout: Duration::from_secs(6),
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    /// Where a group without committed offsets starts: "earliest" or "latest".
    #[must_use]
    pub fn with_auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = policy.into();
        self
    }

    /// Group session timeout.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Upper bound on envelopes returned by one poll (at least 1).
    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Client configuration used for `worker_id`'s consumer.
    #[must_use]
    pub fn client_config(&self, worker_id: usize) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("client.id", format!("{}-{worker_id}", self.group_id))
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        config
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn create(&self, worker_id: usize) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let consumer: StreamConsumer = self.client_config(worker_id).create().map_err(|e| {
            BrokerError::ConnectionFailed(format!("Failed to create consumer {worker_id}: {e}"))
        })?;

        tracing::debug!(
            worker_id,
            group_id = %self.group_id,
            auto_offset_reset = %self.auto_offset_reset,
            "Kafka consumer created"
        );

        Ok(Box::new(KafkaConsumer {
            consumer,
            worker_id,
            max_batch: self.max_batch,
            unstored: Vec::new(),
        }))
    }
}

/// Position handed to the worker but not yet stored for commit.
#[derive(Debug, Clone)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

impl Position {
    /// Offset to commit: the next message the group should read.
    const fn commit_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// One worker's Kafka consumer connection.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    worker_id: usize,
    max_batch: usize,
    unstored: Vec<Position>,
}

impl KafkaConsumer {
    /// Store offsets of the previously returned batch for the next auto-commit.
    fn store_previous_batch(&mut self) {
        for position in self.unstored.drain(..) {
            if let Err(e) = self.consumer.store_offset(
                &position.topic,
                position.partition,
                position.commit_offset(),
            ) {
                tracing::warn!(
                    worker_id = self.worker_id,
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    error = %e,
                    "Failed to store offset (message may be redelivered)"
                );
            }
        }
    }
}

/// Decoded message, or the position of an undecodable one.
enum Received {
    Envelope(Delivery),
    Skipped(Position),
}

fn decode(worker_id: usize, message: &BorrowedMessage<'_>) -> Received {
    let position = Position {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
    };

    let decoded = message
        .payload()
        .ok_or_else(|| BrokerError::DeserializationFailed("Message has no payload".to_string()))
        .and_then(|payload| Envelope::from_bytes(payload).map_err(BrokerError::from));

    match decoded {
        Ok(envelope) => Received::Envelope(Delivery {
            topic: position.topic,
            partition: position.partition,
            offset: position.offset,
            envelope,
        }),
        Err(e) => {
            tracing::warn!(
                worker_id,
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                error = %e,
                "Skipping undecodable message"
            );
            Received::Skipped(position)
        }
    }
}

impl BrokerConsumer for KafkaConsumer {
    fn subscribe<'a>(&'a mut self, topic: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.consumer
                .subscribe(&[topic])
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

            tracing::info!(worker_id = self.worker_id, topic, "Subscribed to topic");
            Ok(())
        })
    }

    fn poll(&mut self) -> BrokerFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            self.store_previous_batch();

            let mut batch = Vec::new();
            while batch.is_empty() {
                let worker_id = self.worker_id;
                let first = self
                    .consumer
                    .recv()
                    .await
                    .map(|message| decode(worker_id, &message))
                    .map_err(|e| {
                        BrokerError::TransportError(format!("Failed to receive message: {e}"))
                    })?;

                let mut received = vec![first];
                while received.len() < self.max_batch {
                    match self.consumer.recv().now_or_never() {
                        Some(Ok(message)) => received.push(decode(worker_id, &message)),
                        Some(Err(e)) => {
                            tracing::warn!(
                                worker_id,
                                error = %e,
                                "Receive error while draining batch"
                            );
                            break;
                        }
                        None => break,
                    }
                }

                for item in received {
                    match item {
                        Received::Envelope(delivery) => {
                            self.unstored.push(Position {
                                topic: delivery.topic.clone(),
                                partition: delivery.partition,
                                offset: delivery.offset,
                            });
                            batch.push(delivery);
                        }
                        // Poison messages are acknowledged so they are not redelivered forever.
                        Received::Skipped(position) => self.unstored.push(position),
                    }
                }
            }
            Ok(batch)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.store_previous_batch();
            self.consumer.unsubscribe();
            tracing::debug!(worker_id = self.worker_id, "Kafka consumer closed");
        })
    }
}

impl std::fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumer")
            .field("worker_id", &self.worker_id)
            .field("max_batch", &self.max_batch)
            .finish_non_exhaustive()
    }
}
