//! Broker abstraction for the request/response shim.
//!
//! The shim layers call/return semantics on top of a generic partitioned
//! publish/subscribe broker. This module defines the seams the rest of the
//! workspace is written against:
//!
//! - [`RequestPublisher`]: publishes envelopes to a topic (shared, `Send + Sync`)
//! - [`BrokerConsumer`]: one consumer connection, owned by exactly one worker
//! - [`ConsumerFactory`]: creates a dedicated consumer connection per worker,
//!   all members of the same consumer group
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ publish  ┌──────────────┐  poll   ┌──────────────────┐
//! │ RpcClient  │─────────►│    Broker    │────────►│ Consumer workers │
//! └────────────┘          │ (partitioned)│         │  (shared group)  │
//!                         └──────────────┘         └──────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: an envelope may be delivered more than once
//! - **Ordered within partition**: no ordering across partitions or workers
//! - **Group load sharing**: each envelope goes to one member of a group
//!
//! # Implementations
//!
//! - `InMemoryBroker` in `hive-shim-testing` - for tests and demos
//! - `KafkaPublisher` / `KafkaConsumerFactory` in `hive-shim-redpanda` - for production

use crate::envelope::{CodecError, Envelope};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker or create a client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an envelope to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a received message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error while polling
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The connection was already closed
    #[error("Consumer closed")]
    Closed,
}

impl From<CodecError> for BrokerError {
    fn from(err: CodecError) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

/// Boxed future returned by the dyn-compatible broker traits.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// One envelope received from the broker, with its position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the envelope was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// The decoded envelope
    pub envelope: Envelope,
}

/// Publishes envelopes to broker topics.
///
/// Implementations must be `Send + Sync`: one publisher is shared by every
/// request dispatcher call site and every backend worker.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn RequestPublisher>`.
pub trait RequestPublisher: Send + Sync {
    /// Publish an envelope to `topic`.
    ///
    /// The envelope's [`Envelope::routing_key`] picks the partition, so
    /// envelopes sharing a key keep their relative order.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker rejects the
    /// envelope or cannot be reached.
    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> BrokerFuture<'a, ()>;
}

/// A single consumer connection.
///
/// A broker consumer is not safe for concurrent use by multiple tasks: each
/// instance is created for, used by, and closed by exactly one worker.
pub trait BrokerConsumer: Send {
    /// Join the consumer group on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription is refused.
    fn subscribe<'a>(&'a mut self, topic: &'a str) -> BrokerFuture<'a, ()>;

    /// Wait for the next batch of envelopes.
    ///
    /// Blocks until at least one envelope is available. The returned future
    /// must be cancel-safe: dropping it before completion must not lose an
    /// envelope that was not yet returned.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportError`] or
    /// [`BrokerError::DeserializationFailed`] on receive failures and
    /// [`BrokerError::Closed`] once the connection is gone.
    fn poll(&mut self) -> BrokerFuture<'_, Vec<Delivery>>;

    /// Leave the group and release the connection.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Creates one dedicated consumer connection per worker.
pub trait ConsumerFactory: Send + Sync {
    /// Consumer group every created connection joins.
    fn group_id(&self) -> &str;

    /// Create the connection for `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the client cannot be built.
    fn create(&self, worker_id: usize) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}
