//! In-process history cache for recent commands and notifications.
//!
//! Frontends answer history lookups from this cache instead of round-tripping
//! to a backend. Each entity kind lives in its own typed [`EntityMap`];
//! [`HistoryCache::store`] routes a [`HistoryRecord`] to the right map by
//! variant.
//!
//! Results are ordered newest first. A `take` of zero means unlimited.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Kinds of cached history entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Commands sent to devices
    Command,
    /// Notifications emitted by devices
    Notification,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Notification => write!(f, "notification"),
        }
    }
}

/// A command addressed to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Command id, unique per device
    pub id: i64,
    /// Target device
    pub device_guid: String,
    /// Command name
    pub command: String,
    /// When the command was issued
    pub timestamp: DateTime<Utc>,
    /// Execution status reported by the device
    pub status: Option<String>,
    /// Opaque parameters
    pub parameters: Option<String>,
    /// Opaque execution result
    pub result: Option<String>,
}

/// A notification emitted by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNotification {
    /// Notification id, unique per device
    pub id: i64,
    /// Emitting device
    pub device_guid: String,
    /// Notification name
    pub notification: String,
    /// When the notification was emitted
    pub timestamp: DateTime<Utc>,
    /// Opaque parameters
    pub parameters: Option<String>,
}

/// Accessors the cache filters and orders by.
pub trait HistoryEntity: Clone + Send + Sync + 'static {
    /// Kind of this entity.
    const KIND: EntityKind;

    /// Entity id.
    fn id(&self) -> i64;

    /// Device the entity belongs to.
    fn device_guid(&self) -> &str;

    /// Command or notification name.
    fn name(&self) -> &str;

    /// Ordering timestamp.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Status, if the kind has one.
    fn status(&self) -> Option<&str> {
        None
    }

    /// Map key.
    fn cache_key(&self) -> String {
        format!("{}-{}", self.id(), self.device_guid())
    }
}

impl HistoryEntity for DeviceCommand {
    const KIND: EntityKind = EntityKind::Command;

    fn id(&self) -> i64 {
        self.id
    }

    fn device_guid(&self) -> &str {
        &self.device_guid
    }

    fn name(&self) -> &str {
        &self.command
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

impl HistoryEntity for DeviceNotification {
    const KIND: EntityKind = EntityKind::Notification;

    fn id(&self) -> i64 {
        self.id
    }

    fn device_guid(&self) -> &str {
        &self.device_guid
    }

    fn name(&self) -> &str {
        &self.notification
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Either entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRecord {
    /// A command
    Command(DeviceCommand),
    /// A notification
    Notification(DeviceNotification),
}

impl HistoryRecord {
    /// Kind of the wrapped entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Command(_) => EntityKind::Command,
            Self::Notification(_) => EntityKind::Notification,
        }
    }
}

/// History query. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Single device
    pub device_guid: Option<String>,
    /// Any of these devices
    pub devices: HashSet<String>,
    /// Any of these names
    pub names: HashSet<String>,
    /// Inclusive lower timestamp bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper timestamp bound
    pub end: Option<DateTime<Utc>>,
    /// Exact status; entities without a status never match
    pub status: Option<String>,
    /// Maximum results, 0 for unlimited
    pub take: usize,
}

impl HistoryFilter {
    /// Filter for one device.
    #[must_use]
    pub fn for_device(device_guid: impl Into<String>) -> Self {
        Self {
            device_guid: Some(device_guid.into()),
            ..Self::default()
        }
    }

    /// Restrict to any of `names`.
    #[must_use]
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to any of `devices`.
    #[must_use]
    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = devices.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the inclusive window `[start, end]`.
    #[must_use]
    pub const fn between(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Restrict to `status`.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Return at most `take` results.
    #[must_use]
    pub const fn take(mut self, take: usize) -> Self {
        self.take = take;
        self
    }

    fn matches<T: HistoryEntity>(&self, entity: &T) -> bool {
        let guid = entity.device_guid();
        self.device_guid.as_deref().is_none_or(|wanted| wanted == guid)
            && (self.devices.is_empty() || self.devices.contains(guid))
            && (self.names.is_empty() || self.names.contains(entity.name()))
            && self.start.is_none_or(|start| entity.timestamp() >= start)
            && self.end.is_none_or(|end| entity.timestamp() <= end)
            && self
                .status
                .as_deref()
                .is_none_or(|wanted| entity.status() == Some(wanted))
    }
}

/// Concurrent map of one entity kind.
pub struct EntityMap<T> {
    entries: DashMap<String, T>,
}

impl<T: HistoryEntity> EntityMap<T> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or replace `entity`.
    pub fn store(&self, entity: T) {
        tracing::debug!(
            kind = %T::KIND,
            id = entity.id(),
            device_guid = entity.device_guid(),
            "Caching history entity"
        );
        self.entries.insert(entity.cache_key(), entity);
    }

    /// Look up one entity by id and device.
    #[must_use]
    pub fn find_one(&self, id: i64, device_guid: &str) -> Option<T> {
        self.entries
            .get(&format!("{id}-{device_guid}"))
            .map(|entry| entry.value().clone())
    }

    /// Entities matching `filter`, newest first.
    #[must_use]
    pub fn find(&self, filter: &HistoryFilter) -> Vec<T> {
        let mut found: Vec<T> = self
            .entries
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| {
            b.timestamp()
                .cmp(&a.timestamp())
                .then_with(|| b.id().cmp(&a.id()))
        });
        if filter.take > 0 {
            found.truncate(filter.take);
        }
        found
    }

    /// Number of cached entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Typed history cache.
pub struct HistoryCache {
    commands: EntityMap<DeviceCommand>,
    notifications: EntityMap<DeviceNotification>,
}

impl HistoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands: EntityMap::new(),
            notifications: EntityMap::new(),
        }
    }

    /// Cached commands.
    #[must_use]
    pub const fn commands(&self) -> &EntityMap<DeviceCommand> {
        &self.commands
    }

    /// Cached notifications.
    #[must_use]
    pub const fn notifications(&self) -> &EntityMap<DeviceNotification> {
        &self.notifications
    }

    /// Store a record in the map for its kind.
    pub fn store(&self, record: HistoryRecord) {
        match record {
            HistoryRecord::Command(command) => self.commands.store(command),
            HistoryRecord::Notification(notification) => self.notifications.store(notification),
        }
    }
}

impl Default for HistoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn command(
        id: i64,
        device: &str,
        name: &str,
        minutes: i64,
        status: Option<&str>,
    ) -> HistoryRecord {
        HistoryRecord::Command(DeviceCommand {
            id,
            device_guid: device.to_string(),
            command: name.to_string(),
            timestamp: at(minutes),
            status: status.map(str::to_string),
            parameters: None,
            result: None,
        })
    }

    fn notification(id: i64, device: &str, name: &str, minutes: i64) -> HistoryRecord {
        HistoryRecord::Notification(DeviceNotification {
            id,
            device_guid: device.to_string(),
            notification: name.to_string(),
            timestamp: at(minutes),
            parameters: None,
        })
    }

    #[test]
    fn store_routes_by_kind() {
        let cache = HistoryCache::new();
        cache.store(command(1, "dev-a", "reboot", 0, None));
        cache.store(notification(1, "dev-a", "temperature", 1));

        assert_eq!(cache.commands().len(), 1);
        assert_eq!(cache.notifications().len(), 1);
        assert_eq!(cache.commands().find_one(1, "dev-a").unwrap().command, "reboot");
        assert!(cache.commands().find_one(1, "dev-b").is_none());
    }

    #[test]
    fn find_orders_newest_first_and_limits() {
        let cache = HistoryCache::new();
        for (id, minutes) in [(1, 5), (2, 1), (3, 9), (4, 3)] {
            cache.store(notification(id, "dev-a", "temperature", minutes));
        }

        let all = cache.notifications().find(&HistoryFilter::for_device("dev-a"));
        let ids: Vec<i64> = all.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![3, 1, 4, 2]);

        let top = cache.notifications().find(&HistoryFilter::for_device("dev-a").take(2));
        assert_eq!(top.iter().map(|n| n.id).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn filters_combine() {
        let cache = HistoryCache::new();
        cache.store(command(1, "dev-a", "reboot", 0, Some("done")));
        cache.store(command(2, "dev-a", "reboot", 10, Some("pending")));
        cache.store(command(3, "dev-b", "reboot", 5, Some("done")));
        cache.store(command(4, "dev-c", "update", 6, Some("done")));
        cache.store(command(5, "dev-a", "update", 7, None));

        let done_reboots = cache.commands().find(
            &HistoryFilter::default()
                .with_names(["reboot"])
                .with_status("done"),
        );
        assert_eq!(done_reboots.iter().map(|c| c.id).collect::<Vec<_>>(), vec![3, 1]);

        let windowed = cache.commands().find(
            &HistoryFilter::default()
                .with_devices(["dev-a", "dev-c"])
                .between(Some(at(5)), Some(at(7))),
        );
        assert_eq!(windowed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[test]
    fn status_filter_excludes_kinds_without_status() {
        let cache = HistoryCache::new();
        cache.store(notification(1, "dev-a", "temperature", 0));

        let found = cache.notifications().find(&HistoryFilter::default().with_status("done"));
        assert!(found.is_empty());
    }

    #[test]
    fn store_replaces_same_key() {
        let cache = HistoryCache::new();
        cache.store(command(1, "dev-a", "reboot", 0, Some("pending")));
        cache.store(command(1, "dev-a", "reboot", 0, Some("done")));

        assert_eq!(cache.commands().len(), 1);
        assert_eq!(
            cache.commands().find_one(1, "dev-a").unwrap().status.as_deref(),
            Some("done")
        );
    }
}
