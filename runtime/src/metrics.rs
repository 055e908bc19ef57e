//! Prometheus metrics for the request/response shim.
//!
//! This module provides metric collection for:
//! - Dispatched requests and publish failures
//! - Response routing (delivered, orphaned, timed out, cancelled)
//! - Consumer pool health (active workers, faults, restarts)
//!
//! Recording goes through the `metrics` facade and is a no-op until a recorder
//! is installed, e.g. by [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use hive_shim_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint is advertised on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder can only be installed once per process. A second call logs a
    /// warning and succeeds without a render handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Dispatcher
    describe_counter!("rpc_requests_sent_total", "Requests published by the dispatcher");
    describe_counter!("rpc_publish_errors_total", "Requests that could not be published");

    // Registry
    describe_counter!("rpc_responses_delivered_total", "Responses routed to a waiting caller");
    describe_counter!("rpc_orphan_responses_total", "Responses dropped without a pending call");
    describe_counter!("rpc_timeouts_total", "Pending calls resolved by timeout");
    describe_counter!("rpc_cancellations_total", "Pending calls resolved by cancellation");
    describe_gauge!("rpc_pending_calls", "Calls currently waiting for a response");
    describe_histogram!(
        "rpc_roundtrip_duration_seconds",
        "Time from registration to response delivery"
    );

    // Consumer pools
    describe_gauge!("consumer_pool_active_workers", "Workers subscribed and polling");
    describe_counter!("consumer_pool_worker_faults_total", "Workers terminated by a fault");
    describe_counter!("consumer_pool_worker_restarts_total", "Replacement workers spawned");
}

/// Dispatcher and registry metrics recorder.
pub struct RpcMetrics;

impl RpcMetrics {
    /// Record a published request.
    pub fn record_sent() {
        counter!("rpc_requests_sent_total").increment(1);
    }

    /// Record a failed publish.
    pub fn record_publish_error() {
        counter!("rpc_publish_errors_total").increment(1);
    }

    /// Record a delivered response and its round-trip time.
    pub fn record_delivered(elapsed: Duration) {
        counter!("rpc_responses_delivered_total").increment(1);
        histogram!("rpc_roundtrip_duration_seconds").record(elapsed.as_secs_f64());
    }

    /// Record an orphan response.
    pub fn record_orphan() {
        counter!("rpc_orphan_responses_total").increment(1);
    }

    /// Record a timed-out call.
    pub fn record_timeout() {
        counter!("rpc_timeouts_total").increment(1);
    }

    /// Record a cancelled call.
    pub fn record_cancelled() {
        counter!("rpc_cancellations_total").increment(1);
    }

    /// Record a call entering the pending table.
    pub fn pending_added() {
        gauge!("rpc_pending_calls").increment(1.0);
    }

    /// Record a call leaving the pending table.
    pub fn pending_removed() {
        gauge!("rpc_pending_calls").decrement(1.0);
    }
}

/// Consumer pool metrics recorder.
pub struct PoolMetrics;

impl PoolMetrics {
    /// Record the number of active workers in `pool`.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active(pool: &'static str, active: usize) {
        gauge!("consumer_pool_active_workers", "pool" => pool).set(active as f64);
    }

    /// Record a worker fault in `pool`.
    pub fn record_fault(pool: &'static str) {
        counter!("consumer_pool_worker_faults_total", "pool" => pool).increment(1);
    }

    /// Record a replacement worker in `pool`.
    pub fn record_restart(pool: &'static str) {
        counter!("consumer_pool_worker_restarts_total", "pool" => pool).increment(1);
    }
}
