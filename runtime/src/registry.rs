//! Correlation registry routing responses to waiting callers.
//!
//! [`RequestResponseMatcher`] maps each in-flight [`CorrelationId`] to a
//! pending completion. Responses polled by consumer workers are offered to the
//! registry, which resolves the matching caller. Timeouts and cancellations go
//! through the same map.
//!
//! # Arbitration
//!
//! Every resolution path (response, timeout, cancellation, sweep) starts with
//! an atomic remove-if-present on the map. Whichever path removes the entry
//! first resolves the call; every later attempt finds nothing and is a no-op.
//! This is the single arbitration point guaranteeing at-most-once resolution.
//!
//! # Concurrency
//!
//! The map is a sharded [`DashMap`], so registrations and deliveries for
//! different ids do not serialize behind one lock. No lock is held while a
//! completion is sent, and the registry is never locked across a broker call.
//!
//! # Example
//!
//! ```ignore
//! let matcher = Arc::new(RequestResponseMatcher::new());
//! let pending = matcher.register(CorrelationId::new("c1"))?;
//!
//! // ... a consumer worker later calls:
//! matcher.offer_response(response_envelope);
//!
//! let response = pending.wait().await?;
//! ```

use crate::metrics::RpcMetrics;
use crate::worker::DeliveryHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hive_shim_core::environment::{Clock, SystemClock};
use hive_shim_core::{CorrelationId, Delivery, Envelope, EnvelopeKind, RpcError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<Envelope, RpcError>>;

/// A registered, not yet resolved call.
#[derive(Debug)]
struct PendingCall {
    created_at: DateTime<Utc>,
    completion: Completion,
}

/// What happened to an offered response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The response resolved a pending call.
    Delivered,
    /// No pending call matched; the response was dropped.
    Orphan,
}

/// Concurrent map from correlation id to pending call.
///
/// Shared by reference between every consumer worker and every dispatcher
/// call site. Nothing else mutates pending-call completion state.
pub struct RequestResponseMatcher {
    pending: DashMap<CorrelationId, PendingCall>,
    clock: Arc<dyn Clock>,
}

impl RequestResponseMatcher {
    /// Create an empty registry using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty registry stamping pending calls with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: DashMap::new(),
            clock,
        }
    }

    /// Register a pending call for `correlation_id`.
    ///
    /// Must complete before the request is published, otherwise a fast
    /// response can arrive before its handle exists and be dropped as an
    /// orphan.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelationId`] if the id is already
    /// registered. The existing entry is left untouched.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
    ) -> Result<PendingResponse, RpcError> {
        let (completion, receiver) = oneshot::channel();

        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    "Duplicate correlation id rejected"
                );
                return Err(RpcError::DuplicateCorrelationId(correlation_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    created_at: self.clock.now(),
                    completion,
                });
                RpcMetrics::pending_added();
            }
        }

        tracing::trace!(correlation_id = %correlation_id, "Pending call registered");

        Ok(PendingResponse {
            correlation_id,
            receiver,
            matcher: Arc::downgrade(self),
            settled: false,
        })
    }

    /// Route a response envelope to the caller waiting on its correlation id.
    ///
    /// Unknown ids (already timed out, issued by another process instance, or
    /// delivered twice) are dropped and logged as orphans. This never fails
    /// and never blocks the calling worker.
    pub fn offer_response(&self, envelope: Envelope) -> OfferOutcome {
        if envelope.kind != EnvelopeKind::Response {
            tracing::warn!(
                correlation_id = %envelope.correlation_id,
                action = %envelope.action,
                "Dropping request envelope offered as response"
            );
            RpcMetrics::record_orphan();
            return OfferOutcome::Orphan;
        }

        let Some((correlation_id, call)) = self.pending.remove(&envelope.correlation_id) else {
            tracing::debug!(
                correlation_id = %envelope.correlation_id,
                action = %envelope.action,
                "Orphan response dropped"
            );
            RpcMetrics::record_orphan();
            return OfferOutcome::Orphan;
        };
        RpcMetrics::pending_removed();

        let elapsed = (self.clock.now() - call.created_at)
            .to_std()
            .unwrap_or_default();
        RpcMetrics::record_delivered(elapsed);

        let outcome = match envelope.error.clone() {
            Some(remote) => Err(RpcError::Remote(remote)),
            None => Ok(envelope),
        };
        if call.completion.send(outcome).is_err() {
            tracing::debug!(
                correlation_id = %correlation_id,
                "Caller went away before its response was delivered"
            );
        } else {
            tracing::trace!(
                correlation_id = %correlation_id,
                elapsed_ms = elapsed.as_millis(),
                "Response delivered"
            );
        }
        OfferOutcome::Delivered
    }

    /// Resolve `correlation_id` with a timeout, if it is still pending.
    ///
    /// Returns `true` if this call resolved the entry, `false` if another
    /// path got there first.
    pub fn expire(&self, correlation_id: &CorrelationId, timeout: Duration) -> bool {
        let resolved = self.resolve(
            correlation_id,
            RpcError::Timeout {
                correlation_id: correlation_id.clone(),
                timeout,
            },
        );
        if resolved {
            RpcMetrics::record_timeout();
            tracing::debug!(
                correlation_id = %correlation_id,
                timeout_ms = timeout.as_millis(),
                "Pending call timed out"
            );
        }
        resolved
    }

    /// Resolve `correlation_id` as cancelled, if it is still pending.
    ///
    /// Returns `true` if this call resolved the entry.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        let resolved = self.resolve(correlation_id, RpcError::Cancelled(correlation_id.clone()));
        if resolved {
            RpcMetrics::record_cancelled();
            tracing::debug!(correlation_id = %correlation_id, "Pending call cancelled");
        }
        resolved
    }

    /// Expire every call registered more than `max_age` ago.
    ///
    /// Returns the number of calls this sweep resolved.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        // Collect first: removing while iterating would deadlock on the shard.
        let stale: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| {
                (now - entry.value().created_at)
                    .to_std()
                    .is_ok_and(|age| age > max_age)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let expired = stale
            .iter()
            .filter(|correlation_id| self.expire(correlation_id, max_age))
            .count();
        if expired > 0 {
            tracing::info!(expired, max_age_ms = max_age.as_millis(), "Swept stale calls");
        }
        expired
    }

    /// Number of calls still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `correlation_id` is still waiting for a response.
    #[must_use]
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    fn resolve(&self, correlation_id: &CorrelationId, error: RpcError) -> bool {
        let Some((_, call)) = self.pending.remove(correlation_id) else {
            return false;
        };
        RpcMetrics::pending_removed();
        // The receiver may already be gone; the entry is reclaimed either way.
        let _ = call.completion.send(Err(error));
        true
    }
}

impl Default for RequestResponseMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestResponseMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseMatcher")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeliveryHandler for RequestResponseMatcher {
    async fn deliver(&self, delivery: Delivery) {
        self.offer_response(delivery.envelope);
    }
}

/// Handle returned by [`RequestResponseMatcher::register`].
///
/// Await it with [`PendingResponse::wait`]. Dropping an unresolved handle
/// cancels the call and reclaims its registry slot.
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<Envelope, RpcError>>,
    matcher: Weak<RequestResponseMatcher>,
    settled: bool,
}

impl PendingResponse {
    /// The id this handle waits on.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Cancel the call. Returns `true` if the call was still pending.
    pub fn cancel(&self) -> bool {
        self.matcher
            .upgrade()
            .is_some_and(|matcher| matcher.cancel(&self.correlation_id))
    }

    /// Wait for the call to be resolved.
    ///
    /// # Errors
    ///
    /// Returns the failure the call was resolved with:
    /// [`RpcError::Timeout`], [`RpcError::Cancelled`] or [`RpcError::Remote`].
    /// If the registry itself is dropped, the call resolves as cancelled.
    pub async fn wait(mut self) -> Result<Envelope, RpcError> {
        let outcome = (&mut self.receiver).await;
        self.settled = true;
        outcome.unwrap_or_else(|_| Err(RpcError::Cancelled(self.correlation_id.clone())))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use hive_shim_core::RemoteError;

    fn response(id: &str, body: Vec<u8>) -> Envelope {
        let request = Envelope::request(CorrelationId::new(id), "test/echo", vec![]);
        Envelope::response_to(&request, body)
    }

    #[tokio::test]
    async fn delivered_response_resolves_caller_with_exact_payload() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let pending = matcher.register(CorrelationId::new("c1")).unwrap();

        let outcome = matcher.offer_response(response("c1", vec![1, 2, 3]));

        assert_eq!(outcome, OfferOutcome::Delivered);
        let envelope = pending.wait().await.unwrap();
        assert_eq!(envelope.body, vec![1, 2, 3]);
        assert_eq!(matcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_leaves_first_call_intact() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let first = matcher.register(CorrelationId::new("dup")).unwrap();

        let second = matcher.register(CorrelationId::new("dup"));
        assert!(matches!(second, Err(RpcError::DuplicateCorrelationId(_))));
        assert!(matcher.contains(&CorrelationId::new("dup")));

        matcher.offer_response(response("dup", vec![7]));
        assert_eq!(first.wait().await.unwrap().body, vec![7]);
    }

    #[tokio::test]
    async fn expire_then_late_response_is_orphan() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let id = CorrelationId::new("c1");
        let pending = matcher.register(id.clone()).unwrap();

        assert!(matcher.expire(&id, Duration::from_millis(50)));
        let result = pending.wait().await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert!(!matcher.contains(&id));

        assert_eq!(matcher.offer_response(response("c1", vec![])), OfferOutcome::Orphan);
    }

    #[tokio::test]
    async fn response_before_expire_wins() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let id = CorrelationId::new("race");
        let pending = matcher.register(id.clone()).unwrap();

        assert_eq!(matcher.offer_response(response("race", vec![5])), OfferOutcome::Delivered);
        assert!(!matcher.expire(&id, Duration::from_millis(1)));
        assert!(!matcher.cancel(&id));
        assert_eq!(pending.wait().await.unwrap().body, vec![5]);
    }

    #[test]
    fn unknown_id_is_orphan() {
        let matcher = RequestResponseMatcher::new();
        assert_eq!(matcher.offer_response(response("never-issued", vec![])), OfferOutcome::Orphan);
    }

    #[test]
    fn request_kind_is_never_delivered() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let _pending = matcher.register(CorrelationId::new("c1")).unwrap();

        let request = Envelope::request(CorrelationId::new("c1"), "oops", vec![]);
        assert_eq!(matcher.offer_response(request), OfferOutcome::Orphan);
        assert!(matcher.contains(&CorrelationId::new("c1")));
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_error() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let pending = matcher.register(CorrelationId::new("c1")).unwrap();

        let request = Envelope::request(CorrelationId::new("c1"), "device/get", vec![]);
        matcher.offer_response(Envelope::failure_to(&request, RemoteError::new(404, "missing")));

        match pending.wait().await {
            Err(RpcError::Remote(remote)) => assert_eq!(remote.code, 404),
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[test]
    fn dropping_handle_reclaims_slot() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let pending = matcher.register(CorrelationId::new("abandoned")).unwrap();
        assert_eq!(matcher.pending_count(), 1);

        drop(pending);
        assert_eq!(matcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_through_handle() {
        let matcher = Arc::new(RequestResponseMatcher::new());
        let pending = matcher.register(CorrelationId::new("c1")).unwrap();

        assert!(pending.cancel());
        assert!(matches!(pending.wait().await, Err(RpcError::Cancelled(_))));
    }

    fn pending_gauge(handle: &metrics_exporter_prometheus::PrometheusHandle) -> f64 {
        handle
            .render()
            .lines()
            .find_map(|line| line.strip_prefix("rpc_pending_calls "))
            .map_or(0.0, |value| value.trim().parse().unwrap())
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn pending_gauge_counts_calls_across_registries() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let first = Arc::new(RequestResponseMatcher::new());
            let second = Arc::new(RequestResponseMatcher::new());

            let a = first.register(CorrelationId::new("a")).unwrap();
            let b = first.register(CorrelationId::new("b")).unwrap();
            let c = second.register(CorrelationId::new("c")).unwrap();
            assert!(first.register(CorrelationId::new("a")).is_err());
            assert_eq!(pending_gauge(&handle), 3.0);

            assert_eq!(first.offer_response(response("a", vec![])), OfferOutcome::Delivered);
            assert_eq!(first.offer_response(response("a", vec![])), OfferOutcome::Orphan);
            assert!(c.cancel());
            assert!(!second.expire(&CorrelationId::new("c"), Duration::from_millis(1)));
            assert_eq!(pending_gauge(&handle), 1.0);

            drop((a, c));
            drop(b);
            assert_eq!(pending_gauge(&handle), 0.0);
        });
    }
}
