//! Platform state touched by uplink messages.

use crate::dedup::DedupWindow;
use crate::error::ServerResult;
use edgesync_protocol::{AlarmSeverity, AlarmStatus, EdgeId, EntityId, EntityType, TenantId};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Applied message ids a [`MemoryPlatformStore`] keeps per edge by default.
pub const DEFAULT_APPLIED_CAPACITY: usize = 100_000;

/// A platform entity, identified by name within its tenant and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    /// Entity id.
    pub id: EntityId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Name, unique per tenant and type.
    pub name: String,
    /// Sub-type label.
    pub kind: String,
    /// Opaque attributes.
    pub body: Option<Vec<u8>>,
}

/// A platform alarm, identified by originator and alarm type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRecord {
    /// Alarm id.
    pub id: EntityId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Originating entity.
    pub originator: EntityId,
    /// Alarm type.
    pub alarm_type: String,
    /// Status.
    pub status: AlarmStatus,
    /// Severity.
    pub severity: AlarmSeverity,
    /// Opaque details.
    pub details: Option<Vec<u8>>,
}

/// Downstream side effect of a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Entity created.
    EntityCreated(EntityId),
    /// Entity changed.
    EntityUpdated(EntityId),
    /// Entity removed.
    EntityDeleted(EntityId),
    /// Alarm raised.
    AlarmCreated(EntityId),
    /// Alarm status or severity changed.
    AlarmUpdated(EntityId, AlarmStatus),
    /// Alarm removed.
    AlarmDeleted(EntityId),
}

/// Storage for platform entities and alarms.
pub trait PlatformStore: Send + Sync {
    /// Looks an entity up by natural key.
    fn find_entity_by_name(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        name: &str,
    ) -> ServerResult<Option<EntityRecord>>;

    /// Looks an entity up by id.
    fn find_entity(&self, tenant: TenantId, id: EntityId) -> ServerResult<Option<EntityRecord>>;

    /// Creates or replaces an entity.
    fn save_entity(&self, entity: EntityRecord) -> ServerResult<()>;

    /// Removes an entity. Returns false if it did not exist.
    fn delete_entity(&self, tenant: TenantId, id: EntityId) -> ServerResult<bool>;

    /// Looks an alarm up by originator and type.
    fn find_alarm(
        &self,
        tenant: TenantId,
        originator: EntityId,
        alarm_type: &str,
    ) -> ServerResult<Option<AlarmRecord>>;

    /// Creates or replaces an alarm.
    fn save_alarm(&self, alarm: AlarmRecord) -> ServerResult<()>;

    /// Removes an alarm. Returns false if it did not exist.
    fn delete_alarm(&self, tenant: TenantId, id: EntityId) -> ServerResult<bool>;

    /// Publishes a side effect.
    fn notify(&self, notification: Notification);

    /// True if a message from `edge` was already applied.
    fn is_applied(&self, edge: EdgeId, msg_id: &Uuid) -> ServerResult<bool>;

    /// Records that a message from `edge` was applied.
    ///
    /// The record must be as durable as the state it guards: a platform
    /// restarted over the same store still answers replays as duplicates.
    fn mark_applied(&self, edge: EdgeId, msg_id: Uuid) -> ServerResult<()>;

    /// Drops the applied ids of a removed edge.
    fn forget_applied(&self, edge: EdgeId) -> ServerResult<()>;
}

/// Platform store kept in memory, recording every notification.
///
/// Applied message ids live next to the state, so handlers created over
/// the same store share them the way they would share a database.
#[derive(Debug)]
pub struct MemoryPlatformStore {
    entities: RwLock<HashMap<(TenantId, EntityId), EntityRecord>>,
    alarms: RwLock<HashMap<(TenantId, EntityId), AlarmRecord>>,
    notifications: RwLock<Vec<Notification>>,
    applied: DedupWindow,
}

impl MemoryPlatformStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_applied_capacity(DEFAULT_APPLIED_CAPACITY)
    }

    /// Creates an empty store remembering up to `capacity` applied ids per edge.
    pub fn with_applied_capacity(capacity: usize) -> Self {
        Self {
            entities: RwLock::default(),
            alarms: RwLock::default(),
            notifications: RwLock::default(),
            applied: DedupWindow::new(capacity),
        }
    }

    /// Notifications published so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().clone()
    }

    /// Number of stored entities.
    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    /// All alarms of a tenant.
    pub fn alarms(&self, tenant: TenantId) -> Vec<AlarmRecord> {
        self.alarms
            .read()
            .values()
            .filter(|a| a.tenant == tenant)
            .cloned()
            .collect()
    }
}

impl PlatformStore for MemoryPlatformStore {
    fn find_entity_by_name(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        name: &str,
    ) -> ServerResult<Option<EntityRecord>> {
        Ok(self
            .entities
            .read()
            .values()
            .find(|e| e.tenant == tenant && e.entity_type == entity_type && e.name == name)
            .cloned())
    }

    fn find_entity(&self, tenant: TenantId, id: EntityId) -> ServerResult<Option<EntityRecord>> {
        Ok(self.entities.read().get(&(tenant, id)).cloned())
    }

    fn save_entity(&self, entity: EntityRecord) -> ServerResult<()> {
        self.entities
            .write()
            .insert((entity.tenant, entity.id), entity);
        Ok(())
    }

    fn delete_entity(&self, tenant: TenantId, id: EntityId) -> ServerResult<bool> {
        Ok(self.entities.write().remove(&(tenant, id)).is_some())
    }

    fn find_alarm(
        &self,
        tenant: TenantId,
        originator: EntityId,
        alarm_type: &str,
    ) -> ServerResult<Option<AlarmRecord>> {
        Ok(self
            .alarms
            .read()
            .values()
            .find(|a| a.tenant == tenant && a.originator == originator && a.alarm_type == alarm_type)
            .cloned())
    }

    fn save_alarm(&self, alarm: AlarmRecord) -> ServerResult<()> {
        self.alarms.write().insert((alarm.tenant, alarm.id), alarm);
        Ok(())
    }

    fn delete_alarm(&self, tenant: TenantId, id: EntityId) -> ServerResult<bool> {
        Ok(self.alarms.write().remove(&(tenant, id)).is_some())
    }

    fn notify(&self, notification: Notification) {
        self.notifications.write().push(notification);
    }

    fn is_applied(&self, edge: EdgeId, msg_id: &Uuid) -> ServerResult<bool> {
        Ok(self.applied.contains(edge, msg_id))
    }

    fn mark_applied(&self, edge: EdgeId, msg_id: Uuid) -> ServerResult<()> {
        self.applied.record(edge, msg_id);
        Ok(())
    }

    fn forget_applied(&self, edge: EdgeId) -> ServerResult<()> {
        self.applied.forget(edge);
        Ok(())
    }
}

impl Default for MemoryPlatformStore {
    fn default() -> Self {
        Self::new()
    }
}
