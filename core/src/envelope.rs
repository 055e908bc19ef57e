//! Message envelope exchanged over the broker.
//!
//! An [`Envelope`] is the wire unit of the shim: a request or response body
//! tagged with a [`CorrelationId`] and an action label. The request dispatcher
//! generates the correlation id; backends copy it verbatim into the response so
//! that the correlation registry can route the response back to its caller.
//!
//! # Wire Format
//!
//! Envelopes are encoded with `bincode` over their serde representation. The
//! body itself is opaque bytes: domain objects are encoded by the caller, with
//! [`Envelope::request_typed`] and [`Envelope::decode_body`] as bincode helpers.
//!
//! # Example
//!
//! ```
//! use hive_shim_core::envelope::{CorrelationId, Envelope, EnvelopeKind};
//!
//! let request = Envelope::request(CorrelationId::generate(), "command/insert", vec![1, 2, 3]);
//! let response = Envelope::response_to(&request, vec![4, 5, 6]);
//!
//! assert_eq!(response.kind, EnvelopeKind::Response);
//! assert_eq!(response.correlation_id, request.correlation_id);
//!
//! let bytes = response.to_bytes().unwrap();
//! assert_eq!(Envelope::from_bytes(&bytes).unwrap(), response);
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding envelopes and their bodies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode to bytes.
    #[error("Failed to encode: {0}")]
    Encode(String),

    /// Failed to decode from bytes.
    #[error("Failed to decode: {0}")]
    Decode(String),
}

/// Caller-generated token linking a request to its eventual response.
///
/// The id is unique per in-flight request. It is produced by the request
/// dispatcher, never by the broker or a worker, and travels byte-identical
/// from request to response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, collision-free correlation id (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing token, e.g. one read back from the wire.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether an envelope carries a request or a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Issued by a frontend caller, consumed by a backend worker.
    Request,
    /// Produced by a backend worker, routed back to the waiting caller.
    Response,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Failure reported by a backend handler inside a response envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("remote failure {code}: {message}")]
pub struct RemoteError {
    /// Application-level status code (HTTP-like, e.g. 404 or 500).
    pub code: i32,
    /// Human readable reason.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The unit of data exchanged over the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Token linking request and response.
    pub correlation_id: CorrelationId,
    /// Request or response.
    pub kind: EnvelopeKind,
    /// Label identifying the operation (e.g. `"command/insert"`).
    pub action: String,
    /// Opaque domain body.
    pub body: Vec<u8>,
    /// Topic the backend should publish the response to.
    pub reply_to: Option<String>,
    /// Partitioning key; the correlation id is used when absent.
    pub partition_key: Option<String>,
    /// Set on responses whose handler failed.
    pub error: Option<RemoteError>,
}

impl Envelope {
    /// Build a request envelope.
    #[must_use]
    pub fn request(
        correlation_id: CorrelationId,
        action: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id,
            kind: EnvelopeKind::Request,
            action: action.into(),
            body,
            reply_to: None,
            partition_key: None,
            error: None,
        }
    }

    /// Build a request envelope whose body is the bincode encoding of `body`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the body cannot be serialized.
    pub fn request_typed<T: Serialize>(
        correlation_id: CorrelationId,
        action: impl Into<String>,
        body: &T,
    ) -> Result<Self, CodecError> {
        let bytes = bincode::serialize(body).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self::request(correlation_id, action, bytes))
    }

    /// Build the successful response to `request`.
    ///
    /// The correlation id and partition key are copied verbatim; the action is
    /// kept so that callers can log what the response answers.
    #[must_use]
    pub fn response_to(request: &Self, body: Vec<u8>) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            kind: EnvelopeKind::Response,
            action: request.action.clone(),
            body,
            reply_to: None,
            partition_key: request.partition_key.clone(),
            error: None,
        }
    }

    /// Build the failed response to `request`.
    #[must_use]
    pub fn failure_to(request: &Self, error: RemoteError) -> Self {
        Self {
            error: Some(error),
            ..Self::response_to(request, Vec::new())
        }
    }

    /// Set the reply topic.
    #[must_use]
    pub fn with_reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Key used by the broker to pick a partition.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        self.partition_key
            .as_deref()
            .unwrap_or_else(|| self.correlation_id.as_str())
    }

    /// Decode the body as a bincode-encoded `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the body is not a valid encoding of `T`.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        bincode::deserialize(&self.body).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Encode the whole envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode an envelope read from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
