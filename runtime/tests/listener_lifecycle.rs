//! Listener lifecycle: startup barrier, policies, supervision and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use hive_shim_core::{CorrelationId, Delivery, Envelope, RequestPublisher};
use hive_shim_runtime::{
    ConsumerPool, DeliveryHandler, ExitReason, HealthStatus, LifecycleState, ListenerConfig,
    ListenerError, RequestResponseMatcher, ResponseListener, RestartPolicy, ShutdownOutcome,
    StartupPolicy,
};
use hive_shim_testing::{InMemoryBroker, InMemoryConsumerFactory};
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "response-consumer-group";
const TOPIC: &str = "response_topic";

fn config() -> ListenerConfig {
    ListenerConfig::new(TOPIC)
        .with_worker_count(3)
        .with_startup_timeout(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_millis(500))
}

fn listener(factory: InMemoryConsumerFactory, config: ListenerConfig) -> ResponseListener {
    ResponseListener::response_listener(
        config,
        Arc::new(factory),
        Arc::new(RequestResponseMatcher::new()),
    )
}

fn response(id: &CorrelationId) -> Envelope {
    let request = Envelope::request(id.clone(), "device/get", Vec::new());
    Envelope::response_to(&request, id.as_str().as_bytes().to_vec())
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn start_waits_for_every_worker_and_routes_responses() {
    let broker = InMemoryBroker::new();
    let listener = listener(broker.consumer_factory(GROUP), config());

    let report = listener.start().await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.ready, 3);
    assert_eq!(listener.state(), LifecycleState::Running);
    assert_eq!(listener.active_workers(), 3);
    assert_eq!(broker.member_count(GROUP, TOPIC), 3);
    assert_eq!(listener.health().status, HealthStatus::Healthy);

    let matcher = Arc::clone(listener.handler());
    let id = CorrelationId::generate();
    let pending = matcher.register(id.clone()).unwrap();
    broker.publish(TOPIC, &response(&id)).await.unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(1), pending.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.body, id.as_str().as_bytes());

    assert_eq!(listener.shutdown().await, ShutdownOutcome::Drained);
}

#[tokio::test]
async fn shutdown_stops_deliveries_and_is_idempotent() {
    let broker = InMemoryBroker::new();
    let listener = listener(broker.consumer_factory(GROUP), config());
    listener.start().await.unwrap();

    assert_eq!(listener.shutdown().await, ShutdownOutcome::Drained);
    assert_eq!(listener.state(), LifecycleState::Stopped);
    assert_eq!(listener.active_workers(), 0);
    assert_eq!(broker.member_count(GROUP, TOPIC), 0);

    let matcher = Arc::clone(listener.handler());
    let id = CorrelationId::generate();
    let _pending = matcher.register(id.clone()).unwrap();
    broker.publish(TOPIC, &response(&id)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matcher.contains(&id), "no worker may deliver after shutdown");

    assert_eq!(
        listener.shutdown().await,
        ShutdownOutcome::NotRunning(LifecycleState::Stopped)
    );
    assert_eq!(
        listener.start().await,
        Err(ListenerError::InvalidState(LifecycleState::Stopped))
    );
}

#[tokio::test]
async fn shutdown_before_start_is_a_noop() {
    let listener = listener(InMemoryBroker::new().consumer_factory(GROUP), config());

    assert_eq!(
        listener.shutdown().await,
        ShutdownOutcome::NotRunning(LifecycleState::NotStarted)
    );
    assert_eq!(listener.state(), LifecycleState::NotStarted);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let listener = listener(InMemoryBroker::new().consumer_factory(GROUP), config());
    listener.start().await.unwrap();

    assert_eq!(
        listener.start().await,
        Err(ListenerError::InvalidState(LifecycleState::Running))
    );
    listener.shutdown().await;
}

#[tokio::test]
async fn partial_startup_degrades_by_default() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP).with_subscribe_failures(2, 1);
    let listener = listener(factory, config().with_startup_timeout(Duration::from_millis(200)));
    let mut faults = listener.subscribe_faults();

    let report = listener.start().await.unwrap();

    assert_eq!(report.ready, 2);
    assert!(!report.is_complete());
    assert_eq!(listener.state(), LifecycleState::Running);
    let health = listener.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!((health.active_workers, health.worker_count), (2, 3));
    assert_eq!(health.state, LifecycleState::Running);

    let fault = faults.recv().await.unwrap();
    assert_eq!(fault.worker_id, 2);
    assert!(matches!(fault.reason, ExitReason::SubscriptionFailed(_)));

    listener.shutdown().await;
}

#[tokio::test]
async fn partial_startup_aborts_when_configured() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP).with_subscribe_failures(0, 1);
    let listener = listener(
        factory,
        config()
            .with_startup_timeout(Duration::from_millis(200))
            .with_startup_policy(StartupPolicy::Abort),
    );

    let error = listener.start().await.unwrap_err();

    assert!(matches!(
        error,
        ListenerError::StartupIncomplete {
            ready: 2,
            requested: 3,
            ..
        }
    ));
    assert_eq!(listener.state(), LifecycleState::Stopped);
    assert_eq!(broker.member_count(GROUP, TOPIC), 0);
}

#[tokio::test]
async fn zero_ready_workers_is_fatal() {
    let broker = InMemoryBroker::new();
    let factory = broker
        .consumer_factory(GROUP)
        .with_subscribe_failures(0, 1)
        .with_subscribe_failures(1, 1)
        .with_subscribe_failures(2, 1);
    let listener = listener(factory, config().with_startup_timeout(Duration::from_millis(200)));

    let error = listener.start().await.unwrap_err();

    assert_eq!(
        error,
        ListenerError::NoWorkersReady {
            requested: 3,
            timeout: Duration::from_millis(200),
        }
    );
    assert_eq!(listener.state(), LifecycleState::Stopped);
    assert_eq!(listener.health().status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn pool_without_workers_is_rejected_before_spawning() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP);
    let listener = listener(factory.clone(), config().with_worker_count(0));

    let error = listener.start().await.unwrap_err();

    assert!(matches!(error, ListenerError::InvalidConfig(_)));
    assert_eq!(listener.state(), LifecycleState::NotStarted);
    assert_eq!(listener.active_workers(), 0);
    assert_eq!(factory.created(), 0);
    assert_eq!(broker.member_count(GROUP, TOPIC), 0);
}

#[tokio::test]
async fn faulted_worker_is_not_replaced_under_degrade() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP).with_poll_faults(1, 1);
    let listener = listener(factory.clone(), config());
    let mut faults = listener.subscribe_faults();

    listener.start().await.unwrap();

    let fault = tokio::time::timeout(Duration::from_secs(1), faults.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault.pool, "response-listener");
    assert_eq!(fault.worker_id, 1);
    assert!(matches!(fault.reason, ExitReason::Fault(_)));

    eventually(|| listener.active_workers() == 2).await;
    assert_eq!(factory.created(), 3);
    assert_eq!(listener.health().status, HealthStatus::Degraded);

    // The surviving members took over the faulted worker's partitions.
    let matcher = Arc::clone(listener.handler());
    let ids: Vec<_> = (0..20).map(|_| CorrelationId::generate()).collect();
    let pending: Vec<_> = ids.iter().map(|id| matcher.register(id.clone()).unwrap()).collect();
    for id in &ids {
        broker.publish(TOPIC, &response(id)).await.unwrap();
    }
    for handle in pending {
        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap()
            .unwrap();
    }

    listener.shutdown().await;
}

#[tokio::test]
async fn faulted_worker_is_replaced_within_budget() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP).with_poll_faults(0, 2);
    let listener = listener(
        factory.clone(),
        config().with_restart_policy(RestartPolicy::Replace { max_restarts: 5 }),
    );
    let mut faults = listener.subscribe_faults();

    listener.start().await.unwrap();

    for _ in 0..2 {
        let fault = tokio::time::timeout(Duration::from_secs(1), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.worker_id, 0);
    }

    eventually(|| factory.created() == 5 && listener.active_workers() == 3).await;
    assert_eq!(listener.health().status, HealthStatus::Healthy);

    listener.shutdown().await;
}

#[tokio::test]
async fn restart_budget_is_bounded() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP).with_poll_faults(0, 10);
    let listener = listener(
        factory.clone(),
        config().with_restart_policy(RestartPolicy::Replace { max_restarts: 2 }),
    );
    let mut faults = listener.subscribe_faults();

    listener.start().await.unwrap();

    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(1), faults.recv())
            .await
            .unwrap()
            .unwrap();
    }
    eventually(|| listener.active_workers() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.created(), 5);

    listener.shutdown().await;
}

#[tokio::test]
async fn shutdown_overrun_is_reported_not_forced() {
    let broker = InMemoryBroker::new();
    let factory = broker.consumer_factory(GROUP).with_hanging_close(0);
    let listener = listener(
        factory,
        config().with_shutdown_timeout(Duration::from_millis(100)),
    );
    listener.start().await.unwrap();

    let outcome = listener.shutdown().await;

    assert!(matches!(outcome, ShutdownOutcome::TimedOut { .. }));
    assert_eq!(listener.state(), LifecycleState::Stopped);
    assert_eq!(
        listener.shutdown().await,
        ShutdownOutcome::NotRunning(LifecycleState::Stopped)
    );
}

struct PanickingHandler;

#[async_trait]
impl DeliveryHandler for PanickingHandler {
    async fn deliver(&self, delivery: Delivery) {
        panic!("handler blew up on {}", delivery.envelope.correlation_id);
    }
}

#[tokio::test]
async fn panicking_worker_is_reported_as_fault() {
    let broker = InMemoryBroker::with_partitions(1);
    let pool = ConsumerPool::new(
        "panicking",
        config().with_worker_count(1),
        Arc::new(broker.consumer_factory("panicking-group")),
        Arc::new(PanickingHandler),
    );
    let mut faults = pool.subscribe_faults();
    pool.start().await.unwrap();

    broker
        .publish(TOPIC, &response(&CorrelationId::new("boom")))
        .await
        .unwrap();

    let fault = tokio::time::timeout(Duration::from_secs(1), faults.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault.reason, ExitReason::Panicked);
    eventually(|| pool.active_workers() == 0).await;
    assert_eq!(pool.health().status, HealthStatus::Unhealthy);

    assert_eq!(pool.shutdown().await, ShutdownOutcome::Drained);
}
