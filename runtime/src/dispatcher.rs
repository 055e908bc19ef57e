//! Request dispatcher: call/return semantics over the broker.
//!
//! [`RpcClient::send`] generates a fresh correlation id, registers a pending
//! call, arms a caller-scoped timer, publishes the request and waits for the
//! registry to resolve the call.
//!
//! Registration always completes before the publish starts. A response can
//! therefore never arrive ahead of its pending call.

use crate::metrics::RpcMetrics;
use crate::registry::RequestResponseMatcher;
use hive_shim_core::{CorrelationId, Envelope, RequestPublisher, RpcError, Scheduler};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Timeout applied by [`RpcClient::call`] unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Frontend-side call site.
///
/// Cheap to clone; clones share the registry, publisher and scheduler.
#[derive(Clone)]
pub struct RpcClient {
    matcher: Arc<RequestResponseMatcher>,
    publisher: Arc<dyn RequestPublisher>,
    scheduler: Arc<dyn Scheduler>,
    request_topic: String,
    reply_topic: Option<String>,
    default_timeout: Duration,
}

impl RpcClient {
    /// Create a client publishing to `request_topic`.
    ///
    /// # Arguments
    ///
    /// * `matcher` - Registry shared with the response listener
    /// * `publisher` - Broker producer
    /// * `scheduler` - Arms per-call timeouts
    /// * `request_topic` - Topic backends consume requests from
    #[must_use]
    pub fn new(
        matcher: Arc<RequestResponseMatcher>,
        publisher: Arc<dyn RequestPublisher>,
        scheduler: Arc<dyn Scheduler>,
        request_topic: impl Into<String>,
    ) -> Self {
        Self {
            matcher,
            publisher,
            scheduler,
            request_topic: request_topic.into(),
            reply_topic: None,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Ask backends to answer on `topic` instead of their default.
    #[must_use]
    pub fn with_reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_topic = Some(topic.into());
        self
    }

    /// Set the timeout used by [`call`](Self::call).
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The registry this client registers calls in.
    #[must_use]
    pub const fn matcher(&self) -> &Arc<RequestResponseMatcher> {
        &self.matcher
    }

    /// Send a request and wait for its response body.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if no response arrived within `timeout`
    /// - [`RpcError::BrokerUnavailable`] if the request could not be published
    /// - [`RpcError::Remote`] if the backend handler failed
    pub async fn send(
        &self,
        action: impl Into<String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let request = Envelope::request(CorrelationId::generate(), action, body);
        self.dispatch(request, timeout).await.map(|response| response.body)
    }

    /// [`send`](Self::send) with the default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn call(
        &self,
        action: impl Into<String>,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        self.send(action, body, self.default_timeout).await
    }

    /// Send a bincode-encoded request and decode the response body.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), plus [`RpcError::Codec`] if either body
    /// cannot be encoded or decoded.
    pub async fn send_typed<Req, Resp>(
        &self,
        action: impl Into<String>,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let request = Envelope::request_typed(CorrelationId::generate(), action, body)?;
        let response = self.dispatch(request, timeout).await?;
        Ok(response.decode_body()?)
    }

    /// Dispatch a prepared request envelope and wait for the response envelope.
    ///
    /// The envelope's correlation id must be fresh.
    ///
    /// # Errors
    ///
    /// [`RpcError::DuplicateCorrelationId`] if the id is already in flight,
    /// otherwise the same as [`send`](Self::send).
    pub async fn dispatch(
        &self,
        mut request: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RpcError> {
        if request.reply_to.is_none() {
            request.reply_to.clone_from(&self.reply_topic);
        }
        let correlation_id = request.correlation_id.clone();

        let pending = self.matcher.register(correlation_id.clone())?;

        let matcher = Arc::downgrade(&self.matcher);
        let expired = correlation_id.clone();
        let _timer = self.scheduler.schedule(
            timeout,
            Box::new(move || {
                if let Some(matcher) = matcher.upgrade() {
                    matcher.expire(&expired, timeout);
                }
            }),
        );

        tracing::debug!(
            correlation_id = %correlation_id,
            action = %request.action,
            topic = %self.request_topic,
            timeout_ms = timeout.as_millis(),
            "Dispatching request"
        );

        if let Err(error) = self.publisher.publish(&self.request_topic, &request).await {
            RpcMetrics::record_publish_error();
            tracing::warn!(
                correlation_id = %correlation_id,
                topic = %self.request_topic,
                error = %error,
                "Request publish failed"
            );
            pending.cancel();
            return Err(RpcError::BrokerUnavailable(error));
        }
        RpcMetrics::record_sent();

        pending.wait().await
    }

    /// Publish a request without waiting for, or expecting, a response.
    ///
    /// # Errors
    ///
    /// [`RpcError::BrokerUnavailable`] if the request could not be published.
    pub async fn push(&self, action: impl Into<String>, body: Vec<u8>) -> Result<(), RpcError> {
        let request = Envelope::request(CorrelationId::generate(), action, body);
        self.publisher
            .publish(&self.request_topic, &request)
            .await
            .map_err(|error| {
                RpcMetrics::record_publish_error();
                RpcError::BrokerUnavailable(error)
            })?;
        RpcMetrics::record_sent();
        Ok(())
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("request_topic", &self.request_topic)
            .field("reply_topic", &self.reply_topic)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
