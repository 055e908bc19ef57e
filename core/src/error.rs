//! Errors surfaced to callers of the request dispatcher.

use crate::broker::BrokerError;
use crate::envelope::{CodecError, CorrelationId, RemoteError};
use std::time::Duration;
use thiserror::Error;

/// Outcome of a call that did not produce a response body.
///
/// Only [`RpcError::Timeout`], [`RpcError::BrokerUnavailable`] and
/// [`RpcError::Remote`] are expected in normal operation.
/// [`RpcError::DuplicateCorrelationId`] signals a dispatcher bug and is fatal to
/// that call only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// A pending call with this id is already registered.
    #[error("Correlation id {0} is already registered")]
    DuplicateCorrelationId(CorrelationId),

    /// No response arrived within the caller's timeout.
    #[error("No response for {correlation_id} within {timeout:?}")]
    Timeout {
        /// The expired call
        correlation_id: CorrelationId,
        /// The timeout that elapsed (zero when expired by a sweep)
        timeout: Duration,
    },

    /// The request could not be published.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(#[from] BrokerError),

    /// The call was abandoned before a response arrived.
    #[error("Call {0} was cancelled")]
    Cancelled(CorrelationId),

    /// The backend handler reported a failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A typed body could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl RpcError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::BrokerUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_broker_failures_are_retryable() {
        let timeout = RpcError::Timeout {
            correlation_id: CorrelationId::new("c1"),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert!(RpcError::BrokerUnavailable(BrokerError::Closed).is_retryable());
        assert!(!RpcError::DuplicateCorrelationId(CorrelationId::new("c1")).is_retryable());
        assert!(!RpcError::Remote(RemoteError::new(500, "boom")).is_retryable());
    }
}
