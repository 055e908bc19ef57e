//! Backend request server.
//!
//! The response topic is fed by backends. A [`RequestServer`] is a
//! [`ConsumerPool`] over the request topic whose handler runs each request
//! through a [`RequestHandler`] and publishes the answer, carrying the same
//! correlation id, to the request's `reply_to` topic or the default response
//! topic.

use crate::listener::{ConsumerPool, ListenerConfig};
use crate::worker::DeliveryHandler;
use async_trait::async_trait;
use hive_shim_core::{
    ConsumerFactory, Delivery, Envelope, EnvelopeKind, RemoteError, RequestPublisher,
};
use std::sync::Arc;

/// Application logic answering requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response body for `request`.
    ///
    /// # Errors
    ///
    /// A [`RemoteError`] is sent back to the caller in a failure envelope.
    async fn handle(&self, request: &Envelope) -> Result<Vec<u8>, RemoteError>;
}

/// Delivery handler turning requests into published responses.
pub struct RequestProcessor<R> {
    handler: R,
    publisher: Arc<dyn RequestPublisher>,
    response_topic: String,
}

impl<R: RequestHandler> RequestProcessor<R> {
    /// Create a processor answering on `response_topic` by default.
    #[must_use]
    pub fn new(
        handler: R,
        publisher: Arc<dyn RequestPublisher>,
        response_topic: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            publisher,
            response_topic: response_topic.into(),
        }
    }

    /// The wrapped application handler.
    #[must_use]
    pub const fn handler(&self) -> &R {
        &self.handler
    }

    /// Handle one request and publish its response.
    pub async fn process(&self, request: &Envelope) {
        let response = match self.handler.handle(request).await {
            Ok(body) => Envelope::response_to(request, body),
            Err(error) => {
                tracing::debug!(
                    correlation_id = %request.correlation_id,
                    action = %request.action,
                    code = error.code,
                    "Request handler failed"
                );
                Envelope::failure_to(request, error)
            }
        };

        let topic = request.reply_to.as_deref().unwrap_or(&self.response_topic);
        if let Err(error) = self.publisher.publish(topic, &response).await {
            // The caller will time out; nothing else can be done here.
            tracing::error!(
                correlation_id = %request.correlation_id,
                topic,
                error = %error,
                "Failed to publish response"
            );
        }
    }
}

#[async_trait]
impl<R: RequestHandler> DeliveryHandler for RequestProcessor<R> {
    async fn deliver(&self, delivery: Delivery) {
        if delivery.envelope.kind != EnvelopeKind::Request {
            tracing::warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                correlation_id = %delivery.envelope.correlation_id,
                "Dropping response envelope found on request topic"
            );
            return;
        }
        self.process(&delivery.envelope).await;
    }
}

/// Pool of workers serving the request topic.
pub type RequestServer<R> = ConsumerPool<RequestProcessor<R>>;

impl<R: RequestHandler> ConsumerPool<RequestProcessor<R>> {
    /// Create a request server.
    ///
    /// `config.topic` is the request topic; responses go to `response_topic`
    /// unless the request names its own `reply_to`.
    #[must_use]
    pub fn request_server(
        config: ListenerConfig,
        factory: Arc<dyn ConsumerFactory>,
        publisher: Arc<dyn RequestPublisher>,
        response_topic: impl Into<String>,
        handler: R,
    ) -> Self {
        let processor = RequestProcessor::new(handler, publisher, response_topic);
        Self::new("request-server", config, factory, Arc::new(processor))
    }
}
