//! # Hive Shim Runtime
//!
//! The moving parts of the broker-mediated request/response shim.
//!
//! ## Core Components
//!
//! - **Correlation Registry** ([`RequestResponseMatcher`]): concurrent map from
//!   correlation id to pending call; routes responses to waiting callers
//! - **Consumer Worker** ([`ConsumerWorker`]): one task, one broker connection,
//!   one poll loop feeding a [`DeliveryHandler`]
//! - **Listener Lifecycle Manager** ([`ConsumerPool`], [`ResponseListener`]):
//!   startup barrier, cooperative shutdown, fault supervision
//! - **Request Dispatcher** ([`RpcClient`]): register, publish, await
//! - **Request Server** ([`RequestServer`]): backend side answering requests
//!
//! ## Example
//!
//! ```ignore
//! use hive_shim_runtime::{ListenerConfig, RequestResponseMatcher, ResponseListener, RpcClient, TokioScheduler};
//!
//! let matcher = Arc::new(RequestResponseMatcher::new());
//! let listener = ResponseListener::response_listener(
//!     ListenerConfig::new("response_topic"),
//!     consumer_factory,
//!     Arc::clone(&matcher),
//! );
//! listener.start().await?;
//!
//! let client = RpcClient::new(matcher, publisher, Arc::new(TokioScheduler::current()), "request_topic");
//! let body = client.send("command/insert", payload, Duration::from_secs(5)).await?;
//!
//! listener.shutdown().await;
//! ```

/// Startup barrier shared by a pool and its workers
pub mod barrier;

/// Configuration loading and validation
pub mod config;

/// Request dispatcher
pub mod dispatcher;

/// Health reporting
pub mod health;

/// Typed command and notification history cache
pub mod history;

/// Listener lifecycle manager
pub mod listener;

/// Prometheus metrics for observability
pub mod metrics;

/// Correlation registry
pub mod registry;

/// Tokio-backed scheduler
pub mod scheduler;

/// Backend request server
pub mod server;

/// Consumer worker
pub mod worker;

pub use barrier::StartupBarrier;
pub use config::{ConfigError, ShimConfig};
pub use dispatcher::RpcClient;
pub use health::{HealthReport, HealthStatus, PoolHealth};
pub use listener::{
    ConsumerPool, LifecycleState, ListenerConfig, ListenerError, ResponseListener, RestartPolicy,
    ShutdownOutcome, StartupPolicy, StartupReport, WorkerFault,
};
pub use registry::{OfferOutcome, PendingResponse, RequestResponseMatcher};
pub use scheduler::TokioScheduler;
pub use server::{RequestHandler, RequestProcessor, RequestServer};
pub use worker::{ConsumerWorker, DeliveryHandler, ExitReason, WorkerExit, WorkerState};
