//! In-memory partitioned broker with consumer groups.
//!
//! Fast, deterministic stand-in for Kafka/Redpanda:
//! - Topics are created on first use with a fixed partition count
//! - Records are routed to partitions by hashing [`Envelope::routing_key`]
//! - Each consumer group keeps one read offset per partition, so every record
//!   reaches exactly one member of a group
//! - Partitions are reassigned round-robin whenever a member joins or leaves
//! - A new group starts at the end of each partition; records published before
//!   the first member subscribed are never delivered to it
//!
//! [`InMemoryConsumerFactory`] can inject subscription failures, poll faults
//! and hanging closes per worker id.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Locks are never poisoned in practice

use hive_shim_core::broker::BrokerFuture;
use hive_shim_core::{
    BrokerConsumer, BrokerError, ConsumerFactory, Delivery, Envelope, RequestPublisher,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default partition count of auto-created topics.
pub const DEFAULT_PARTITIONS: usize = 6;

#[derive(Default)]
struct Group {
    /// Subscribed member ids, kept sorted
    members: Vec<u64>,
    /// Next offset to read, per partition
    offsets: Vec<usize>,
}

impl Group {
    fn owner_of(&self, partition: usize) -> Option<u64> {
        if self.members.is_empty() {
            None
        } else {
            Some(self.members[partition % self.members.len()])
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Delivery>>>,
    groups: HashMap<(String, String), Group>,
}

impl State {
    fn topic(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<Delivery>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

struct Shared {
    partitions: usize,
    state: Mutex<State>,
    changed: Notify,
    next_member: AtomicU64,
    fail_publishes: AtomicBool,
}

/// In-memory broker implementing [`RequestPublisher`].
///
/// Cloning shares the same topics and groups.
///
/// # Example
///
/// ```
/// use hive_shim_testing::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// let factory = broker.consumer_factory("response-consumer-group");
/// assert_eq!(broker.record_count("response_topic"), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Broker whose topics have [`DEFAULT_PARTITIONS`] partitions.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Broker whose topics have `partitions` partitions (at least one).
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                next_member: AtomicU64::new(0),
                fail_publishes: AtomicBool::new(false),
            }),
        }
    }

    /// Factory creating consumers that join `group`.
    #[must_use]
    pub fn consumer_factory(&self, group: impl Into<String>) -> InMemoryConsumerFactory {
        InMemoryConsumerFactory {
            broker: self.clone(),
            group: group.into(),
            faults: Arc::new(Mutex::new(FaultPlan::default())),
            created: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every publish fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Records published to `topic` so far, across partitions.
    #[must_use]
    pub fn record_count(&self, topic: &str) -> usize {
        let state = self.shared.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    /// Envelopes published to `topic`, partition by partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<Envelope> {
        let state = self.shared.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flatten()
                    .map(|delivery| delivery.envelope.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members currently subscribed to `topic` under `group`.
    #[must_use]
    pub fn member_count(&self, group: &str, topic: &str) -> usize {
        let state = self.shared.state.lock().unwrap();
        state
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map_or(0, |g| g.members.len())
    }

    /// Partition `key` maps to.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        // Partition counts are small; truncation is intended.
        #[allow(clippy::cast_possible_truncation)]
        let partition = (hasher.finish() % self.shared.partitions as u64) as usize;
        partition
    }

    fn append(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        if self.shared.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        let partition = self.partition_for(envelope.routing_key());
        {
            let mut state = self.shared.state.lock().unwrap();
            let log = &mut state.topic(topic, self.shared.partitions)[partition];
            let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
            log.push(Delivery {
                topic: topic.to_string(),
                partition: i32::try_from(partition).unwrap_or(i32::MAX),
                offset,
                envelope: envelope.clone(),
            });
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    fn join(&self, group: &str, topic: &str) -> u64 {
        let member = self.shared.next_member.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().unwrap();
            let ends: Vec<usize> = state
                .topic(topic, self.shared.partitions)
                .iter()
                .map(Vec::len)
                .collect();
            let entry = state
                .groups
                .entry((group.to_string(), topic.to_string()))
                .or_insert_with(|| Group {
                    members: Vec::new(),
                    offsets: ends,
                });
            entry.members.push(member);
            entry.members.sort_unstable();
        }
        self.shared.changed.notify_waiters();
        member
    }

    fn leave(&self, group: &str, topic: &str, member: u64) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.groups.get_mut(&(group.to_string(), topic.to_string())) {
                entry.members.retain(|m| *m != member);
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Take every unread record of the partitions owned by `member`.
    fn take(&self, group: &str, topic: &str, member: u64) -> Vec<Delivery> {
        let mut state = self.shared.state.lock().unwrap();
        let State { topics, groups } = &mut *state;
        let (Some(partitions), Some(entry)) = (
            topics.get(topic),
            groups.get_mut(&(group.to_string(), topic.to_string())),
        ) else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        for (partition, log) in partitions.iter().enumerate() {
            if entry.owner_of(partition) != Some(member) {
                continue;
            }
            let next = entry.offsets[partition];
            batch.extend(log[next..].iter().cloned());
            entry.offsets[partition] = log.len();
        }
        batch
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestPublisher for InMemoryBroker {
    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> BrokerFuture<'a, ()> {
        Box::pin(async move { self.append(topic, envelope) })
    }
}

#[derive(Default)]
struct FaultPlan {
    /// Remaining subscription failures per worker id
    subscribe: HashMap<usize, usize>,
    /// Remaining first-poll faults per worker id
    poll: HashMap<usize, usize>,
    /// Worker ids whose consumer never finishes closing
    hanging_close: Vec<usize>,
}

impl FaultPlan {
    fn consume(budget: &mut HashMap<usize, usize>, worker_id: usize) -> bool {
        match budget.get_mut(&worker_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// [`ConsumerFactory`] for [`InMemoryBroker`] with fault injection.
#[derive(Clone)]
pub struct InMemoryConsumerFactory {
    broker: InMemoryBroker,
    group: String,
    faults: Arc<Mutex<FaultPlan>>,
    created: Arc<AtomicU64>,
}

impl InMemoryConsumerFactory {
    /// The next `times` consumers created for `worker_id` fail to subscribe.
    #[must_use]
    pub fn with_subscribe_failures(self, worker_id: usize, times: usize) -> Self {
        self.faults.lock().unwrap().subscribe.insert(worker_id, times);
        self
    }

    /// The next `times` consumers created for `worker_id` subscribe, then
    /// fail their first poll.
    #[must_use]
    pub fn with_poll_faults(self, worker_id: usize, times: usize) -> Self {
        self.faults.lock().unwrap().poll.insert(worker_id, times);
        self
    }

    /// Consumers created for `worker_id` never finish closing.
    #[must_use]
    pub fn with_hanging_close(self, worker_id: usize) -> Self {
        self.faults.lock().unwrap().hanging_close.push(worker_id);
        self
    }

    /// Number of consumers created so far.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConsumerFactory for InMemoryConsumerFactory {
    fn group_id(&self) -> &str {
        &self.group
    }

    fn create(&self, worker_id: usize) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut plan = self.faults.lock().unwrap();
        let consumer = InMemoryConsumer {
            broker: self.broker.clone(),
            group: self.group.clone(),
            membership: None,
            fail_subscribe: FaultPlan::consume(&mut plan.subscribe, worker_id),
            fail_first_poll: FaultPlan::consume(&mut plan.poll, worker_id),
            hang_on_close: plan.hanging_close.contains(&worker_id),
        };
        Ok(Box::new(consumer))
    }
}

/// One member of a consumer group.
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    membership: Option<(String, u64)>,
    fail_subscribe: bool,
    fail_first_poll: bool,
    hang_on_close: bool,
}

impl BrokerConsumer for InMemoryConsumer {
    fn subscribe<'a>(&'a mut self, topic: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_subscribe {
                return Err(BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "injected subscription failure".to_string(),
                });
            }
            let member = self.broker.join(&self.group, topic);
            self.membership = Some((topic.to_string(), member));
            Ok(())
        })
    }

    fn poll(&mut self) -> BrokerFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let Some((topic, member)) = self.membership.clone() else {
                return Err(BrokerError::Closed);
            };
            if std::mem::take(&mut self.fail_first_poll) {
                return Err(BrokerError::TransportError("injected poll fault".to_string()));
            }

            loop {
                let changed = self.broker.shared.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                let batch = self.broker.take(&self.group, &topic, member);
                if !batch.is_empty() {
                    return Ok(batch);
                }
                changed.await;
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some((topic, member)) = self.membership.take() {
                self.broker.leave(&self.group, &topic, member);
            }
            if self.hang_on_close {
                std::future::pending::<()>().await;
            }
        })
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if let Some((topic, member)) = self.membership.take() {
            self.broker.leave(&self.group, &topic, member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_shim_core::CorrelationId;
    use std::time::Duration;

    fn response(id: &str) -> Envelope {
        let request = Envelope::request(CorrelationId::new(id), "test", vec![]);
        Envelope::response_to(&request, id.as_bytes().to_vec())
    }

    async fn drain(consumer: &mut Box<dyn BrokerConsumer>) -> Vec<Delivery> {
        tokio::time::timeout(Duration::from_millis(20), consumer.poll())
            .await
            .map_or_else(|_| Vec::new(), Result::unwrap)
    }

    #[tokio::test]
    async fn group_members_split_records() {
        let broker = InMemoryBroker::with_partitions(4);
        let factory = broker.consumer_factory("group");
        let mut first = factory.create(0).unwrap();
        let mut second = factory.create(1).unwrap();
        first.subscribe("responses").await.unwrap();
        second.subscribe("responses").await.unwrap();

        for i in 0..40 {
            broker.publish("responses", &response(&format!("c{i}"))).await.unwrap();
        }

        let mut seen = Vec::new();
        for consumer in [&mut first, &mut second] {
            while let Ok(Ok(batch)) =
                tokio::time::timeout(Duration::from_millis(20), consumer.poll()).await
            {
                seen.extend(batch.into_iter().map(|d| d.envelope.correlation_id));
            }
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn separate_groups_each_see_every_record() {
        let broker = InMemoryBroker::with_partitions(1);
        let mut a = broker.consumer_factory("a").create(0).unwrap();
        let mut b = broker.consumer_factory("b").create(0).unwrap();
        a.subscribe("t").await.unwrap();
        b.subscribe("t").await.unwrap();

        broker.publish("t", &response("x")).await.unwrap();

        assert_eq!(drain(&mut a).await.len(), 1);
        assert_eq!(drain(&mut b).await.len(), 1);
    }

    #[tokio::test]
    async fn partition_order_is_preserved() {
        let broker = InMemoryBroker::with_partitions(3);
        let factory = broker.consumer_factory("group");
        let mut consumer = factory.create(0).unwrap();
        consumer.subscribe("t").await.unwrap();

        for i in 0..5 {
            let envelope = response(&format!("c{i}")).with_partition_key("device-1");
            broker.publish("t", &envelope).await.unwrap();
        }

        let batch = consumer.poll().await.unwrap();
        let offsets: Vec<i64> = batch.iter().map(|d| d.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn records_before_first_subscription_are_skipped() {
        let broker = InMemoryBroker::with_partitions(1);
        broker.publish("t", &response("early")).await.unwrap();

        let factory = broker.consumer_factory("group");
        let mut consumer = factory.create(0).unwrap();
        consumer.subscribe("t").await.unwrap();
        broker.publish("t", &response("late")).await.unwrap();

        let batch = consumer.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope.correlation_id.as_str(), "late");
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let broker = InMemoryBroker::with_partitions(1);
        let mut consumer = broker.consumer_factory("group").create(0).unwrap();
        consumer.subscribe("t").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("t", &response("c1")).await.unwrap();
        });

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer.poll())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn injected_faults() {
        let broker = InMemoryBroker::new();
        let factory = broker
            .consumer_factory("group")
            .with_subscribe_failures(0, 1)
            .with_poll_faults(1, 1);

        let mut failing = factory.create(0).unwrap();
        assert!(matches!(
            failing.subscribe("t").await,
            Err(BrokerError::SubscriptionFailed { .. })
        ));
        let mut retried = factory.create(0).unwrap();
        assert!(retried.subscribe("t").await.is_ok());

        let mut faulty = factory.create(1).unwrap();
        faulty.subscribe("t").await.unwrap();
        assert!(matches!(faulty.poll().await, Err(BrokerError::TransportError(_))));
        assert_eq!(factory.created(), 3);

        broker.fail_publishes(true);
        assert!(matches!(
            broker.publish("t", &response("c1")).await,
            Err(BrokerError::PublishFailed { .. })
        ));
    }

    #[tokio::test]
    async fn close_leaves_group() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.consumer_factory("group").create(0).unwrap();
        consumer.subscribe("t").await.unwrap();
        assert_eq!(broker.member_count("group", "t"), 1);

        consumer.close().await;
        assert_eq!(broker.member_count("group", "t"), 0);
    }
}
