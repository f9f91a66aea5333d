//! Incremental change capture into the outbox.

use crate::error::SyncResult;
use edgesync_outbox::EventOutbox;
use edgesync_protocol::{
    AlarmPayload, EdgeEvent, EdgeEventAction, EdgeId, EntityId, EntityType, TenantId,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

/// Resolves the edges an entity is assigned to.
pub trait RelatedEdges: Send + Sync {
    /// Edges related to `entity`, in a stable order.
    fn edges_for(&self, tenant: TenantId, entity: EntityId) -> SyncResult<Vec<EdgeId>>;
}

/// In-memory entity to edge assignments.
#[derive(Debug, Default)]
pub struct StaticAssignments {
    assignments: RwLock<HashMap<(TenantId, EntityId), BTreeSet<EdgeId>>>,
}

impl StaticAssignments {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns an entity to an edge. Returns false if it already was.
    pub fn assign(&self, tenant: TenantId, entity: EntityId, edge: EdgeId) -> bool {
        self.assignments
            .write()
            .entry((tenant, entity))
            .or_default()
            .insert(edge)
    }

    /// Removes an assignment. Returns false if there was none.
    pub fn unassign(&self, tenant: TenantId, entity: EntityId, edge: EdgeId) -> bool {
        let mut assignments = self.assignments.write();
        let Some(edges) = assignments.get_mut(&(tenant, entity)) else {
            return false;
        };
        let removed = edges.remove(&edge);
        if edges.is_empty() {
            assignments.remove(&(tenant, entity));
        }
        removed
    }
}

impl RelatedEdges for StaticAssignments {
    fn edges_for(&self, tenant: TenantId, entity: EntityId) -> SyncResult<Vec<EdgeId>> {
        Ok(self
            .assignments
            .read()
            .get(&(tenant, entity))
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default())
    }
}

/// Which edges a captured change was queued for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    /// Edges and the sequence id assigned there.
    pub queued: Vec<(EdgeId, u64)>,
    /// Edges whose append failed; the producer should retry those.
    pub failed: Vec<(EdgeId, String)>,
}

impl CaptureReport {
    /// True if the change was queued everywhere it had to go.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An alarm as tracked by its producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAlarm {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Alarm id.
    pub id: EntityId,
    /// Id of the originating entity, used to find its edges.
    pub originator_id: EntityId,
    /// Last known snapshot.
    pub payload: AlarmPayload,
}

/// Turns central mutations into outbox events, one per related edge.
pub struct ChangeCapture {
    outbox: Arc<EventOutbox>,
    related: Arc<dyn RelatedEdges>,
}

impl ChangeCapture {
    /// Creates a capture writing to `outbox`.
    pub fn new(outbox: Arc<EventOutbox>, related: Arc<dyn RelatedEdges>) -> Self {
        Self { outbox, related }
    }

    /// Queues one event for a single edge.
    pub fn record_for_edge(
        &self,
        tenant: TenantId,
        edge: EdgeId,
        entity_type: EntityType,
        action: EdgeEventAction,
        entity: EntityId,
        body: Option<Vec<u8>>,
    ) -> SyncResult<u64> {
        let event = EdgeEvent::new(tenant, edge, entity_type, action, entity, body);
        let receipt = self.outbox.append(edge, vec![event])?;
        Ok(receipt.last_seq)
    }

    /// Queues a change of `entity` for every edge it is assigned to.
    ///
    /// A failed append on one edge does not stop the others; it is logged
    /// and listed in the report.
    pub fn record(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        action: EdgeEventAction,
        entity: EntityId,
        body: Option<Vec<u8>>,
    ) -> SyncResult<CaptureReport> {
        self.record_related(tenant, entity, entity_type, action, entity, body)
    }

    fn record_related(
        &self,
        tenant: TenantId,
        related_to: EntityId,
        entity_type: EntityType,
        action: EdgeEventAction,
        entity: EntityId,
        body: Option<Vec<u8>>,
    ) -> SyncResult<CaptureReport> {
        let mut report = CaptureReport::default();
        for edge in self.related.edges_for(tenant, related_to)? {
            match self.record_for_edge(tenant, edge, entity_type, action, entity, body.clone()) {
                Ok(seq) => report.queued.push((edge, seq)),
                Err(e) => {
                    error!(edge_id = %edge, %entity, error = %e, "failed to queue edge event");
                    report.failed.push((edge, e.to_string()));
                }
            }
        }
        debug!(
            %entity,
            action = ?action,
            edges = report.queued.len(),
            "captured change"
        );
        Ok(report)
    }

    fn record_alarm(
        &self,
        alarm: &TrackedAlarm,
        action: EdgeEventAction,
    ) -> SyncResult<CaptureReport> {
        let body = alarm.payload.encode()?;
        self.record_related(
            alarm.tenant,
            alarm.originator_id,
            EntityType::Alarm,
            action,
            alarm.id,
            Some(body),
        )
    }

    /// Queues a newly raised alarm to the originator's edges.
    pub fn alarm_created(&self, alarm: &TrackedAlarm) -> SyncResult<CaptureReport> {
        self.record_alarm(alarm, EdgeEventAction::Added)
    }

    /// Acknowledges an alarm and queues the change.
    ///
    /// Nothing is queued if the alarm was already acknowledged.
    pub fn alarm_acknowledged(&self, alarm: &mut TrackedAlarm) -> SyncResult<CaptureReport> {
        if alarm.payload.status.is_ack() {
            return Ok(CaptureReport::default());
        }
        alarm.payload.status = alarm.payload.status.acknowledged();
        self.record_alarm(alarm, EdgeEventAction::AlarmAck)
    }

    /// Clears an alarm and queues the change.
    ///
    /// Nothing is queued if the alarm was already cleared.
    pub fn alarm_cleared(&self, alarm: &mut TrackedAlarm) -> SyncResult<CaptureReport> {
        if alarm.payload.status.is_cleared() {
            return Ok(CaptureReport::default());
        }
        alarm.payload.status = alarm.payload.status.cleared();
        self.record_alarm(alarm, EdgeEventAction::AlarmClear)
    }

    /// Queues the deletion of an alarm with its last known snapshot.
    pub fn alarm_deleted(&self, alarm: &TrackedAlarm) -> SyncResult<CaptureReport> {
        self.record_alarm(alarm, EdgeEventAction::Deleted)
    }
}
