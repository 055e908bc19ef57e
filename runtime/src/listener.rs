//! Listener lifecycle manager.
//!
//! A [`ConsumerPool`] owns a fixed set of [`ConsumerWorker`]s, each with its
//! own broker connection, all subscribed to one topic under one consumer
//! group. It brings them up behind a [`StartupBarrier`] and tears them down
//! with cooperative cancellation plus a bounded drain.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted --start()--> Running --shutdown()--> Draining --> Stopped
//! ```
//!
//! `start` is only valid from `NotStarted`. `shutdown` only acts from
//! `Running`; every other call is a no-op reporting
//! [`ShutdownOutcome::NotRunning`].
//!
//! ## Supervision
//!
//! A supervisor task joins every worker. Worker faults are broadcast to
//! [`ConsumerPool::subscribe_faults`] receivers and handled according to the
//! pool's [`RestartPolicy`].
//!
//! ## Example
//!
//! ```ignore
//! let matcher = Arc::new(RequestResponseMatcher::new());
//! let listener = ResponseListener::response_listener(
//!     ListenerConfig::new("response_topic").with_worker_count(3),
//!     factory,
//!     Arc::clone(&matcher),
//! );
//!
//! listener.start().await?;
//! // ... dispatch requests ...
//! listener.shutdown().await;
//! ```

use crate::barrier::StartupBarrier;
use crate::health::PoolHealth;
use crate::metrics::PoolMetrics;
use crate::registry::RequestResponseMatcher;
use crate::worker::{ConsumerWorker, DeliveryHandler, ExitReason, WorkerContext, WorkerExit};
use futures::FutureExt;
use hive_shim_core::ConsumerFactory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Default bound on the startup barrier wait.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default bound on the shutdown drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default number of consumer workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

const FAULT_CHANNEL_CAPACITY: usize = 64;

/// What a partially ready pool does once the startup bound elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupPolicy {
    /// Proceed with the workers that are ready and log a warning.
    #[default]
    Degrade,
    /// Tear the pool down and fail the start.
    Abort,
}

/// What the supervisor does when a worker terminates with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Keep running with reduced capacity.
    #[default]
    Degrade,
    /// Spawn a replacement worker, at most `max_restarts` times over the
    /// lifetime of the pool.
    Replace {
        /// Restart budget
        max_restarts: u32,
    },
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Topic every worker subscribes to
    pub topic: String,
    /// Number of workers, each with its own connection
    pub worker_count: usize,
    /// Bound on the startup barrier wait
    pub startup_timeout: Duration,
    /// Bound on the shutdown drain
    pub shutdown_timeout: Duration,
    /// Partial readiness handling
    pub startup_policy: StartupPolicy,
    /// Fault handling
    pub restart_policy: RestartPolicy,
}

impl ListenerConfig {
    /// Configuration for `topic` with default bounds and policies.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            worker_count: DEFAULT_WORKER_COUNT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            startup_policy: StartupPolicy::default(),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Set the number of workers.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the startup barrier bound.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the shutdown drain bound.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the startup policy.
    #[must_use]
    pub const fn with_startup_policy(mut self, policy: StartupPolicy) -> Self {
        self.startup_policy = policy;
        self
    }

    /// Set the restart policy.
    #[must_use]
    pub const fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Check the configuration can describe a running pool.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::InvalidConfig`] for an empty topic or a
    /// worker count of zero.
    pub fn validate(&self) -> Result<(), ListenerError> {
        if self.topic.is_empty() {
            return Err(ListenerError::InvalidConfig("topic must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(ListenerError::InvalidConfig("worker_count must be at least 1"));
        }
        Ok(())
    }
}

/// Externally visible pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, `start` not called yet
    NotStarted,
    /// Workers spawned
    Running,
    /// Shutdown in progress
    Draining,
    /// Shut down, or failed to start
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors surfaced by [`ConsumerPool::start`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The configuration cannot run a pool. Nothing was spawned.
    #[error("Invalid listener configuration: {0}")]
    InvalidConfig(&'static str),

    /// `start` was called outside `NotStarted`.
    #[error("Cannot start pool in state {0}")]
    InvalidState(LifecycleState),

    /// No worker subscribed within the bound. The pool has been torn down.
    #[error("No consumer worker ready after {timeout:?} ({requested} requested)")]
    NoWorkersReady {
        /// Workers requested
        requested: usize,
        /// Startup bound
        timeout: Duration,
    },

    /// Some workers were not ready and the policy is [`StartupPolicy::Abort`].
    /// The pool has been torn down.
    #[error("Only {ready} of {requested} consumer workers ready after {timeout:?}")]
    StartupIncomplete {
        /// Workers that signalled the barrier
        ready: usize,
        /// Workers requested
        requested: usize,
        /// Startup bound
        timeout: Duration,
    },
}

/// Result of a successful start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupReport {
    /// Workers requested
    pub requested: usize,
    /// Workers that signalled the barrier within the bound
    pub ready: usize,
}

impl StartupReport {
    /// Whether every requested worker is subscribed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.ready == self.requested
    }
}

/// Result of [`ConsumerPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every worker terminated within the bound.
    Drained,
    /// The bound elapsed first. Remaining workers keep draining in the
    /// background; they are not killed.
    TimedOut {
        /// Workers still subscribed when the bound elapsed
        still_active: usize,
    },
    /// The pool was not running; nothing was done.
    NotRunning(LifecycleState),
}

/// A worker termination other than a requested stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFault {
    /// Pool the worker belonged to
    pub pool: &'static str,
    /// Worker id within the pool
    pub worker_id: usize,
    /// What went wrong
    pub reason: ExitReason,
}

struct RunningPool {
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
}

enum PoolState {
    NotStarted,
    Running(RunningPool),
    Draining,
    Stopped,
}

impl PoolState {
    const fn lifecycle(&self) -> LifecycleState {
        match self {
            Self::NotStarted => LifecycleState::NotStarted,
            Self::Running(_) => LifecycleState::Running,
            Self::Draining => LifecycleState::Draining,
            Self::Stopped => LifecycleState::Stopped,
        }
    }
}

/// Pool of consumer workers sharing one topic, one group and one handler.
pub struct ConsumerPool<H: DeliveryHandler> {
    name: &'static str,
    config: ListenerConfig,
    factory: Arc<dyn ConsumerFactory>,
    handler: Arc<H>,
    active: Arc<AtomicUsize>,
    faults: broadcast::Sender<WorkerFault>,
    state: Mutex<PoolState>,
}

/// Pool feeding polled responses into the correlation registry.
pub type ResponseListener = ConsumerPool<RequestResponseMatcher>;

impl ConsumerPool<RequestResponseMatcher> {
    /// Create the response listener for `matcher`.
    #[must_use]
    pub fn response_listener(
        config: ListenerConfig,
        factory: Arc<dyn ConsumerFactory>,
        matcher: Arc<RequestResponseMatcher>,
    ) -> Self {
        Self::new("response-listener", config, factory, matcher)
    }
}

impl<H: DeliveryHandler> ConsumerPool<H> {
    /// Create a pool. Nothing is spawned until [`start`](Self::start).
    ///
    /// # Arguments
    ///
    /// * `name` - Pool name used in logs and metric labels
    /// * `config` - Topic, worker count, bounds and policies
    /// * `factory` - Creates one dedicated connection per worker
    /// * `handler` - Receives every delivery
    #[must_use]
    pub fn new(
        name: &'static str,
        config: ListenerConfig,
        factory: Arc<dyn ConsumerFactory>,
        handler: Arc<H>,
    ) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self {
            name,
            config,
            factory,
            handler,
            active: Arc::new(AtomicUsize::new(0)),
            faults,
            state: Mutex::new(PoolState::NotStarted),
        }
    }

    /// Spawn the workers and wait on the startup barrier.
    ///
    /// Returns once every worker subscribed, or once the startup bound
    /// elapsed. In the latter case the [`StartupPolicy`] decides between a
    /// degraded start (logged as a warning) and an aborted one.
    ///
    /// # Errors
    ///
    /// - [`ListenerError::InvalidConfig`] if the configuration has no workers
    ///   or no topic
    /// - [`ListenerError::InvalidState`] if the pool was already started
    /// - [`ListenerError::NoWorkersReady`] if no worker subscribed in time
    /// - [`ListenerError::StartupIncomplete`] if the policy is
    ///   [`StartupPolicy::Abort`] and some workers were not ready
    pub async fn start(&self) -> Result<StartupReport, ListenerError> {
        self.config.validate()?;
        let requested = self.config.worker_count;
        let barrier = StartupBarrier::new(requested);

        {
            let mut state = self.lock_state();
            if !matches!(*state, PoolState::NotStarted) {
                return Err(ListenerError::InvalidState(state.lifecycle()));
            }

            let shutdown = CancellationToken::new();
            let context = WorkerContext {
                pool: self.name,
                topic: self.config.topic.clone(),
                handler: Arc::clone(&self.handler),
                shutdown: shutdown.clone(),
                active: Arc::clone(&self.active),
            };

            let mut workers = JoinSet::new();
            for worker_id in 0..requested {
                spawn_worker(
                    &mut workers,
                    worker_id,
                    self.factory.as_ref(),
                    barrier.clone(),
                    &context,
                );
            }

            let supervisor = Supervisor {
                policy: self.config.restart_policy,
                restarts: 0,
                factory: Arc::clone(&self.factory),
                context,
                workers,
                faults: self.faults.clone(),
            };
            *state = PoolState::Running(RunningPool {
                shutdown,
                supervisor: tokio::spawn(supervisor.run()),
            });
        }

        tracing::info!(
            pool = self.name,
            topic = %self.config.topic,
            group_id = self.factory.group_id(),
            workers = requested,
            "Starting consumer pool"
        );

        let all_ready = barrier.wait(self.config.startup_timeout).await;
        let ready = requested.saturating_sub(barrier.remaining());
        let report = StartupReport { requested, ready };
        let timeout = self.config.startup_timeout;

        if all_ready {
            tracing::info!(pool = self.name, workers = requested, "Consumer pool ready");
            return Ok(report);
        }

        if ready == 0 {
            tracing::error!(
                pool = self.name,
                requested,
                timeout_ms = timeout.as_millis(),
                "No consumer worker ready, tearing pool down"
            );
            self.shutdown().await;
            return Err(ListenerError::NoWorkersReady { requested, timeout });
        }

        match self.config.startup_policy {
            StartupPolicy::Degrade => {
                tracing::warn!(
                    pool = self.name,
                    ready,
                    requested,
                    timeout_ms = timeout.as_millis(),
                    "Consumer pool started degraded; responses on unassigned partitions may be lost"
                );
                Ok(report)
            }
            StartupPolicy::Abort => {
                tracing::error!(
                    pool = self.name,
                    ready,
                    requested,
                    "Consumer pool incomplete, aborting start"
                );
                self.shutdown().await;
                Err(ListenerError::StartupIncomplete {
                    ready,
                    requested,
                    timeout,
                })
            }
        }
    }

    /// Signal every worker to stop and wait for them up to the drain bound.
    ///
    /// Workers exceeding the bound are left to finish on their own. Calling
    /// this on a pool that is not running does nothing.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let running = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, PoolState::Draining) {
                PoolState::Running(running) => running,
                other => {
                    let lifecycle = other.lifecycle();
                    *state = other;
                    tracing::debug!(pool = self.name, state = %lifecycle, "Shutdown ignored");
                    return ShutdownOutcome::NotRunning(lifecycle);
                }
            }
        };

        tracing::info!(pool = self.name, "Shutting down consumer pool");
        running.shutdown.cancel();

        let outcome =
            match tokio::time::timeout(self.config.shutdown_timeout, running.supervisor).await {
                Ok(_) => {
                    tracing::info!(pool = self.name, "Consumer pool stopped");
                    ShutdownOutcome::Drained
                }
                Err(_) => {
                    let still_active = self.active_workers();
                    tracing::warn!(
                        pool = self.name,
                        still_active,
                        timeout_ms = self.config.shutdown_timeout.as_millis(),
                        "Consumer pool did not drain within bound"
                    );
                    ShutdownOutcome::TimedOut { still_active }
                }
            };

        *self.lock_state() = PoolState::Stopped;
        outcome
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock_state().lifecycle()
    }

    /// Workers currently subscribed and polling.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Receive every worker fault from now on.
    #[must_use]
    pub fn subscribe_faults(&self) -> broadcast::Receiver<WorkerFault> {
        self.faults.subscribe()
    }

    /// The shared delivery handler.
    #[must_use]
    pub const fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Pool name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Health of the pool.
    ///
    /// Healthy when every worker is active, degraded when some are, and
    /// unhealthy when none are or the pool is not running.
    #[must_use]
    pub fn health(&self) -> PoolHealth {
        PoolHealth::assess(
            self.name,
            self.state(),
            self.active_workers(),
            self.config.worker_count,
        )
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: DeliveryHandler> Drop for ConsumerPool<H> {
    fn drop(&mut self) {
        if let PoolState::Running(running) = &*self.lock_state() {
            running.shutdown.cancel();
        }
    }
}

impl<H: DeliveryHandler> fmt::Debug for ConsumerPool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("active_workers", &self.active_workers())
            .finish_non_exhaustive()
    }
}

/// Spawn one worker on its own connection.
///
/// A connection that cannot be created is reported through the join set as
/// a subscription failure, so the supervisor sees it like any other fault.
fn spawn_worker<H: DeliveryHandler>(
    workers: &mut JoinSet<WorkerExit>,
    worker_id: usize,
    factory: &dyn ConsumerFactory,
    barrier: StartupBarrier,
    context: &WorkerContext<H>,
) {
    match factory.create(worker_id) {
        Ok(consumer) => {
            let worker = ConsumerWorker::new(worker_id, consumer, barrier, context.clone());
            workers.spawn(async move {
                AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await
                    .unwrap_or(WorkerExit {
                        worker_id,
                        reason: ExitReason::Panicked,
                    })
            });
        }
        Err(error) => {
            tracing::error!(
                pool = context.pool,
                worker_id,
                error = %error,
                "Failed to create consumer connection"
            );
            workers.spawn(async move {
                WorkerExit {
                    worker_id,
                    reason: ExitReason::SubscriptionFailed(error),
                }
            });
        }
    }
}

/// Joins workers, reports faults and applies the restart policy.
struct Supervisor<H: DeliveryHandler> {
    policy: RestartPolicy,
    restarts: u32,
    factory: Arc<dyn ConsumerFactory>,
    context: WorkerContext<H>,
    workers: JoinSet<WorkerExit>,
    faults: broadcast::Sender<WorkerFault>,
}

impl<H: DeliveryHandler> Supervisor<H> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.context.shutdown.cancelled() => break,
                joined = self.workers.join_next() => match joined {
                    Some(Ok(exit)) => self.on_exit(exit),
                    Some(Err(error)) => tracing::warn!(
                        pool = self.context.pool,
                        error = %error,
                        "Worker task aborted"
                    ),
                    None => {
                        tracing::warn!(pool = self.context.pool, "All consumer workers terminated");
                        self.context.shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }

        while let Some(joined) = self.workers.join_next().await {
            if let Ok(exit) = joined {
                tracing::debug!(
                    pool = self.context.pool,
                    worker_id = exit.worker_id,
                    reason = %exit.reason,
                    "Worker drained"
                );
            }
        }
    }

    fn on_exit(&mut self, exit: WorkerExit) {
        if !exit.reason.is_fault() {
            return;
        }

        PoolMetrics::record_fault(self.context.pool);
        // No receivers is fine.
        let _ = self.faults.send(WorkerFault {
            pool: self.context.pool,
            worker_id: exit.worker_id,
            reason: exit.reason,
        });

        match self.policy {
            RestartPolicy::Replace { max_restarts } if self.restarts < max_restarts => {
                self.restarts += 1;
                PoolMetrics::record_restart(self.context.pool);
                tracing::warn!(
                    pool = self.context.pool,
                    worker_id = exit.worker_id,
                    restart = self.restarts,
                    max_restarts,
                    "Replacing faulted consumer worker"
                );
                spawn_worker(
                    &mut self.workers,
                    exit.worker_id,
                    self.factory.as_ref(),
                    StartupBarrier::new(1),
                    &self.context,
                );
            }
            RestartPolicy::Replace { max_restarts } => tracing::warn!(
                pool = self.context.pool,
                worker_id = exit.worker_id,
                max_restarts,
                active = self.context.active.load(Ordering::Acquire),
                "Restart budget exhausted, continuing with reduced capacity"
            ),
            RestartPolicy::Degrade => tracing::warn!(
                pool = self.context.pool,
                worker_id = exit.worker_id,
                active = self.context.active.load(Ordering::Acquire),
                "Continuing with reduced capacity"
            ),
        }
    }
}
