//! Loopback Demo - request server and client over the in-memory broker
//!
//! Wires a device backend (a [`RequestServer`]) and a frontend client
//! ([`RpcClient`] + [`ResponseListener`]) over one [`InMemoryBroker`], then
//! issues a handful of calls:
//!
//! - `command/insert` stores a device command in the backend's history cache
//! - `command/list` reads it back, newest first
//! - `echo` returns its body
//! - anything else fails remotely with code 404
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info,hive_shim_runtime=debug cargo run -p hive-shim-loopback
//! ```
//!
//! Configuration comes from `HIVE_SHIM_*` variables, e.g.
//! `HIVE_SHIM_CONSUMER_THREADS=5`.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::Utc;
use hive_shim_core::{Envelope, RemoteError, RequestPublisher, RpcError};
use hive_shim_runtime::history::{DeviceCommand, HistoryCache, HistoryFilter, HistoryRecord};
use hive_shim_runtime::metrics::MetricsServer;
use hive_shim_runtime::{
    HealthReport, RequestHandler, RequestResponseMatcher, RequestServer, ResponseListener,
    RpcClient, ShimConfig, TokioScheduler,
};
use hive_shim_testing::InMemoryBroker;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEVICE: &str = "e50d6085-2aba-48e9-b1c3-73c673e414be";

/// Backend answering device command requests from its history cache.
struct DeviceBackend {
    history: HistoryCache,
    next_id: AtomicI64,
}

impl DeviceBackend {
    fn new() -> Self {
        Self {
            history: HistoryCache::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn insert(&self, request: &Envelope) -> Result<Vec<u8>, RemoteError> {
        let (device_guid, command): (String, String) = request.decode_body().map_err(bad_request)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.history.store(HistoryRecord::Command(DeviceCommand {
            id,
            device_guid,
            command,
            timestamp: Utc::now(),
            status: None,
            parameters: None,
            result: None,
        }));
        bincode::serialize(&id).map_err(internal)
    }

    fn list(&self, request: &Envelope) -> Result<Vec<u8>, RemoteError> {
        let device_guid: String = request.decode_body().map_err(bad_request)?;
        let commands = self.history.commands().find(&HistoryFilter::for_device(device_guid));
        bincode::serialize(&commands).map_err(internal)
    }
}

fn bad_request(error: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(400, error.to_string())
}

fn internal(error: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(500, error.to_string())
}

#[async_trait]
impl RequestHandler for DeviceBackend {
    async fn handle(&self, request: &Envelope) -> Result<Vec<u8>, RemoteError> {
        match request.action.as_str() {
            "command/insert" => self.insert(request),
            "command/list" => self.list(request),
            "echo" => Ok(request.body.clone()),
            other => Err(RemoteError::new(404, format!("unknown action {other}"))),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hive_shim_loopback=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ShimConfig::from_env()?;
    tracing::info!(?config, "Starting loopback demo");

    // 2. Install the metrics recorder
    let mut metrics = MetricsServer::new("127.0.0.1:9000".parse()?);
    metrics.start()?;

    // 3. Broker, backend and frontend
    let broker = InMemoryBroker::new();
    let publisher: Arc<dyn RequestPublisher> = Arc::new(broker.clone());
    let matcher = Arc::new(RequestResponseMatcher::new());

    let listener = ResponseListener::response_listener(
        config.listener(),
        Arc::new(broker.consumer_factory(config.consumer_group.as_str())),
        Arc::clone(&matcher),
    );
    let server = RequestServer::request_server(
        config.server(),
        Arc::new(broker.consumer_factory("device-backend")),
        Arc::clone(&publisher),
        config.response_topic.as_str(),
        DeviceBackend::new(),
    );

    // The listener must be subscribed before the first request goes out.
    let report = listener.start().await?;
    tracing::info!(ready = report.ready, requested = report.requested, "Response listener started");
    let report = server.start().await?;
    tracing::info!(ready = report.ready, requested = report.requested, "Request server started");

    let client = RpcClient::new(
        matcher,
        publisher,
        Arc::new(TokioScheduler::current()),
        config.request_topic.as_str(),
    )
    .with_default_timeout(config.request_timeout());

    // 4. Concurrent calls
    let timeout = config.request_timeout();
    let inserts: Vec<_> = ["reboot", "set-led", "firmware-update"]
        .into_iter()
        .map(|command| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_typed::<_, i64>(
                        "command/insert",
                        &(DEVICE.to_string(), command.to_string()),
                        timeout,
                    )
                    .await
            })
        })
        .collect();
    for insert in inserts {
        let id = insert.await??;
        tracing::info!(id, "Command inserted");
    }

    let commands: Vec<DeviceCommand> = client
        .send_typed("command/list", &DEVICE.to_string(), timeout)
        .await?;
    for command in &commands {
        tracing::info!(id = command.id, command = %command.command, "Command in history");
    }

    let echoed = client.call("echo", b"loopback".to_vec()).await?;
    tracing::info!(body = %String::from_utf8_lossy(&echoed), "Echo answered");

    match client.call("device/explode", Vec::new()).await {
        Err(RpcError::Remote(error)) => {
            tracing::info!(code = error.code, message = %error.message, "Remote failure surfaced");
        }
        other => tracing::warn!(?other, "Unexpected answer to unknown action"),
    }

    // 5. Health and shutdown
    let health = HealthReport::new(vec![listener.health(), server.health()]);
    tracing::info!(status = %health.status, "Health report");

    let outcome = server.shutdown().await;
    tracing::info!(?outcome, "Request server stopped");
    let outcome = listener.shutdown().await;
    tracing::info!(?outcome, "Response listener stopped");

    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }

    Ok(())
}
