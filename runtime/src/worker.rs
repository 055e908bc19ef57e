//! Consumer worker: one task, one broker connection, one poll loop.
//!
//! A [`ConsumerWorker`] subscribes its dedicated consumer to the pool's topic
//! under the shared group, signals the [`StartupBarrier`], then polls forever,
//! forwarding each delivery to its [`DeliveryHandler`] in arrival order.
//!
//! # States
//!
//! ```text
//! Created → Subscribing → Subscribed → Polling ⟲ → ShuttingDown → Terminated
//! ```
//!
//! # Cancellation
//!
//! The pool's [`CancellationToken`] is raced against the pending subscribe or
//! poll call. Cancellation is the normal exit path, not an error. Any other
//! failure surfacing from `poll` ends this worker with [`ExitReason::Fault`];
//! it is not retried in place. The pool's supervisor decides what happens next.
//!
//! Whatever the exit path, the consumer connection is closed before the worker
//! reports its exit.

use crate::barrier::StartupBarrier;
use crate::metrics::PoolMetrics;
use async_trait::async_trait;
use hive_shim_core::{BrokerConsumer, BrokerError, Delivery};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Receives every delivery polled by a worker.
///
/// Implementations are shared by all workers of a pool and must not block:
/// a slow handler stalls its worker's partitions.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handle one delivery. Failures are absorbed and logged by the handler.
    async fn deliver(&self, delivery: Delivery);
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, not yet running
    Created,
    /// Joining the consumer group
    Subscribing,
    /// Subscription confirmed, barrier signalled
    Subscribed,
    /// Inside the poll loop
    Polling,
    /// Releasing the connection
    ShuttingDown,
    /// Done
    Terminated,
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The pool asked the worker to stop.
    Cancelled,
    /// The consumer could not join the group.
    SubscriptionFailed(BrokerError),
    /// The poll loop failed.
    Fault(BrokerError),
    /// The worker task panicked.
    Panicked,
}

impl ExitReason {
    /// Whether the exit was anything other than a requested stop.
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::SubscriptionFailed(error) => write!(f, "subscription failed: {error}"),
            Self::Fault(error) => write!(f, "poll failed: {error}"),
            Self::Panicked => write!(f, "panicked"),
        }
    }
}

/// Exit report of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Worker id within its pool
    pub worker_id: usize,
    /// Why it stopped
    pub reason: ExitReason,
}

/// Shared state handed to every worker of a pool.
pub(crate) struct WorkerContext<H> {
    pub(crate) pool: &'static str,
    pub(crate) topic: String,
    pub(crate) handler: Arc<H>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) active: Arc<AtomicUsize>,
}

impl<H> Clone for WorkerContext<H> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool,
            topic: self.topic.clone(),
            handler: Arc::clone(&self.handler),
            shutdown: self.shutdown.clone(),
            active: Arc::clone(&self.active),
        }
    }
}

/// Single-connection consumer loop.
pub struct ConsumerWorker<H> {
    id: usize,
    consumer: Box<dyn BrokerConsumer>,
    barrier: StartupBarrier,
    context: WorkerContext<H>,
    state: WorkerState,
}

impl<H: DeliveryHandler> ConsumerWorker<H> {
    pub(crate) fn new(
        id: usize,
        consumer: Box<dyn BrokerConsumer>,
        barrier: StartupBarrier,
        context: WorkerContext<H>,
    ) -> Self {
        Self {
            id,
            consumer,
            barrier,
            context,
            state: WorkerState::Created,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until cancelled or faulted, then close the connection.
    pub async fn run(mut self) -> WorkerExit {
        let reason = self.subscribe_and_poll().await;

        self.transition(WorkerState::ShuttingDown);
        self.consumer.close().await;
        self.transition(WorkerState::Terminated);

        match &reason {
            ExitReason::Cancelled => tracing::debug!(
                pool = self.context.pool,
                worker_id = self.id,
                "Consumer worker stopped"
            ),
            other => tracing::error!(
                pool = self.context.pool,
                worker_id = self.id,
                reason = %other,
                "Consumer worker terminated"
            ),
        }

        WorkerExit {
            worker_id: self.id,
            reason,
        }
    }

    async fn subscribe_and_poll(&mut self) -> ExitReason {
        self.transition(WorkerState::Subscribing);
        let subscribed = tokio::select! {
            biased;
            () = self.context.shutdown.cancelled() => return ExitReason::Cancelled,
            result = self.consumer.subscribe(&self.context.topic) => result,
        };
        if let Err(error) = subscribed {
            return ExitReason::SubscriptionFailed(error);
        }

        self.transition(WorkerState::Subscribed);
        let _active = ActiveGuard::enter(self.context.pool, Arc::clone(&self.context.active));
        self.barrier.count_down();
        tracing::info!(
            pool = self.context.pool,
            worker_id = self.id,
            topic = %self.context.topic,
            "Consumer worker subscribed"
        );

        self.transition(WorkerState::Polling);
        loop {
            let polled = tokio::select! {
                biased;
                () = self.context.shutdown.cancelled() => return ExitReason::Cancelled,
                polled = self.consumer.poll() => polled,
            };

            match polled {
                Ok(batch) => {
                    for delivery in batch {
                        tracing::trace!(
                            worker_id = self.id,
                            topic = %delivery.topic,
                            partition = delivery.partition,
                            offset = delivery.offset,
                            correlation_id = %delivery.envelope.correlation_id,
                            "Received envelope"
                        );
                        self.context.handler.deliver(delivery).await;
                    }
                }
                Err(error) => return ExitReason::Fault(error),
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(
            pool = self.context.pool,
            worker_id = self.id,
            from = ?self.state,
            to = ?next,
            "Worker state change"
        );
        self.state = next;
    }
}

/// Counts a worker as active while it is subscribed, including during unwinding.
struct ActiveGuard {
    pool: &'static str,
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(pool: &'static str, active: Arc<AtomicUsize>) -> Self {
        let now = active.fetch_add(1, Ordering::AcqRel) + 1;
        PoolMetrics::set_active(pool, now);
        Self { pool, active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        PoolMetrics::set_active(self.pool, now);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use hive_shim_core::broker::BrokerFuture;
    use hive_shim_core::{CorrelationId, Envelope};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Consumer replaying scripted poll results, then blocking forever.
    struct ScriptedConsumer {
        subscribe: Result<(), BrokerError>,
        polls: VecDeque<Result<Vec<Delivery>, BrokerError>>,
        closed: Arc<AtomicBool>,
    }

    impl BrokerConsumer for ScriptedConsumer {
        fn subscribe<'a>(&'a mut self, _topic: &'a str) -> BrokerFuture<'a, ()> {
            let result = self.subscribe.clone();
            Box::pin(async move { result })
        }

        fn poll(&mut self) -> BrokerFuture<'_, Vec<Delivery>> {
            let next = self.polls.pop_front();
            Box::pin(async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }

        fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.closed.store(true, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn deliver(&self, delivery: Delivery) {
            self.seen
                .lock()
                .unwrap()
                .push(delivery.envelope.correlation_id.to_string());
        }
    }

    fn delivery(id: &str, offset: i64) -> Delivery {
        let request = Envelope::request(CorrelationId::new(id), "test", vec![]);
        Delivery {
            topic: "response_topic".to_string(),
            partition: 0,
            offset,
            envelope: Envelope::response_to(&request, vec![]),
        }
    }

    fn worker(
        consumer: ScriptedConsumer,
        barrier: StartupBarrier,
        handler: Arc<Recorder>,
        shutdown: CancellationToken,
        active: Arc<AtomicUsize>,
    ) -> ConsumerWorker<Recorder> {
        let context = WorkerContext {
            pool: "test-pool",
            topic: "response_topic".to_string(),
            handler,
            shutdown,
            active,
        };
        ConsumerWorker::new(0, Box::new(consumer), barrier, context)
    }

    #[tokio::test]
    async fn delivers_in_order_then_stops_on_cancel() {
        let closed = Arc::new(AtomicBool::new(false));
        let consumer = ScriptedConsumer {
            subscribe: Ok(()),
            polls: VecDeque::from([
                Ok(vec![delivery("a", 0), delivery("b", 1)]),
                Ok(vec![delivery("c", 2)]),
            ]),
            closed: Arc::clone(&closed),
        };
        let barrier = StartupBarrier::new(1);
        let handler = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(
            worker(
                consumer,
                barrier.clone(),
                Arc::clone(&handler),
                shutdown.clone(),
                Arc::clone(&active),
            )
            .run(),
        );

        assert!(barrier.wait(Duration::from_secs(1)).await);
        while handler.seen.lock().unwrap().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(active.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        let exit = task.await.unwrap();

        assert_eq!(exit.reason, ExitReason::Cancelled);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscription_failure_skips_barrier_and_closes() {
        let closed = Arc::new(AtomicBool::new(false));
        let consumer = ScriptedConsumer {
            subscribe: Err(BrokerError::SubscriptionFailed {
                topic: "response_topic".to_string(),
                reason: "unknown topic".to_string(),
            }),
            polls: VecDeque::new(),
            closed: Arc::clone(&closed),
        };
        let barrier = StartupBarrier::new(1);

        let exit = worker(
            consumer,
            barrier.clone(),
            Arc::new(Recorder::default()),
            CancellationToken::new(),
            Arc::new(AtomicUsize::new(0)),
        )
        .run()
        .await;

        assert!(matches!(exit.reason, ExitReason::SubscriptionFailed(_)));
        assert_eq!(barrier.remaining(), 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn poll_failure_is_fatal_to_worker() {
        let closed = Arc::new(AtomicBool::new(false));
        let consumer = ScriptedConsumer {
            subscribe: Ok(()),
            polls: VecDeque::from([
                Ok(vec![delivery("a", 0)]),
                Err(BrokerError::TransportError("broker went away".to_string())),
                Ok(vec![delivery("never", 1)]),
            ]),
            closed: Arc::clone(&closed),
        };
        let handler = Arc::new(Recorder::default());
        let active = Arc::new(AtomicUsize::new(0));

        let exit = worker(
            consumer,
            StartupBarrier::new(1),
            Arc::clone(&handler),
            CancellationToken::new(),
            Arc::clone(&active),
        )
        .run()
        .await;

        assert!(matches!(exit.reason, ExitReason::Fault(BrokerError::TransportError(_))));
        assert!(exit.reason.is_fault());
        assert_eq!(*handler.seen.lock().unwrap(), vec!["a"]);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_before_subscribe_exits_cleanly() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let consumer = ScriptedConsumer {
            subscribe: Ok(()),
            polls: VecDeque::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let exit = worker(
            consumer,
            StartupBarrier::new(1),
            Arc::new(Recorder::default()),
            shutdown,
            Arc::new(AtomicUsize::new(0)),
        )
        .run()
        .await;

        assert_eq!(exit.reason, ExitReason::Cancelled);
    }

    #[tokio::test]
    async fn active_count_tracks_every_polling_worker() {
        let barrier = StartupBarrier::new(2);
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let consumer = ScriptedConsumer {
                    subscribe: Ok(()),
                    polls: VecDeque::new(),
                    closed: Arc::new(AtomicBool::new(false)),
                };
                tokio::spawn(
                    worker(
                        consumer,
                        barrier.clone(),
                        Arc::new(Recorder::default()),
                        shutdown.clone(),
                        Arc::clone(&active),
                    )
                    .run(),
                )
            })
            .collect();

        assert!(barrier.wait(Duration::from_secs(1)).await);
        assert_eq!(active.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        for task in tasks {
            assert_eq!(task.await.unwrap().reason, ExitReason::Cancelled);
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
