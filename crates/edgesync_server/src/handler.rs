//! Applies edge-originated batches to platform state.

use crate::config::ServerConfig;
use crate::dedup::DedupWindow;
use crate::error::{ServerError, ServerResult};
use crate::store::{AlarmRecord, EntityRecord, Notification, PlatformStore};
use edgesync_engine::PartitionRouter;
use edgesync_protocol::{
    AlarmPayload, AlarmStatus, BatchAck, EdgeId, EntityId, EntityPayload, EntityType, ItemOutcome,
    ItemStatus, OriginatorRef, SubMessage, TenantId, UpdateMsgType, UpdatePayload, UplinkBatch,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies uplink batches.
///
/// Every sub-message is applied in arrival order and gets its own
/// outcome. A failing item never aborts the batch; the batch is always
/// acknowledged as processed once ownership and size checks pass.
///
/// Applied message ids are recorded in the platform store, so replays are
/// recognised after a restart. The in-memory window only caches the most
/// recent ids of each edge in front of the store.
pub struct UplinkHandler {
    store: Arc<dyn PlatformStore>,
    router: Arc<PartitionRouter>,
    config: ServerConfig,
    dedup: DedupWindow,
}

impl UplinkHandler {
    /// Creates a handler.
    pub fn new(
        store: Arc<dyn PlatformStore>,
        router: Arc<PartitionRouter>,
        config: ServerConfig,
    ) -> Self {
        let dedup = DedupWindow::new(config.dedup_capacity);
        Self {
            store,
            router,
            config,
            dedup,
        }
    }

    /// Handler configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Drops the applied message ids of a removed edge.
    pub fn forget_edge(&self, edge: EdgeId) -> ServerResult<()> {
        self.dedup.forget(edge);
        self.store.forget_applied(edge)
    }

    /// Applies a batch and builds its acknowledgment.
    ///
    /// # Errors
    ///
    /// `NotOwner` if another node drives the edge, `InvalidBatch` if the
    /// batch exceeds the configured size, `Store` if applied ids cannot be
    /// read or recorded. Items before a store failure stay applied and are
    /// reported as duplicates when the batch is redelivered.
    pub fn handle_batch(&self, tenant: TenantId, batch: &UplinkBatch) -> ServerResult<BatchAck> {
        let edge = batch.edge_id;
        if !self.router.owns(tenant, edge) {
            return Err(ServerError::NotOwner { edge });
        }
        if batch.messages.len() > self.config.max_batch_messages {
            return Err(ServerError::InvalidBatch(format!(
                "{} messages exceeds limit of {}",
                batch.messages.len(),
                self.config.max_batch_messages
            )));
        }

        let statuses: Vec<ItemStatus> = batch
            .messages
            .iter()
            .map(|msg| {
                Ok(ItemStatus {
                    msg_id: msg.msg_id,
                    outcome: self.apply_item(tenant, edge, msg)?,
                })
            })
            .collect::<ServerResult<_>>()?;

        let failed = statuses
            .iter()
            .filter(|s| matches!(s.outcome, ItemOutcome::Failed(_)))
            .count();
        if failed > 0 {
            warn!(
                edge_id = %edge,
                batch_id = batch.batch_id,
                failed,
                total = statuses.len(),
                "uplink batch partially applied"
            );
        } else {
            debug!(
                edge_id = %edge,
                batch_id = batch.batch_id,
                count = statuses.len(),
                "uplink batch applied"
            );
        }

        Ok(BatchAck::processed(batch.batch_id, statuses))
    }

    fn apply_item(
        &self,
        tenant: TenantId,
        edge: EdgeId,
        msg: &SubMessage,
    ) -> ServerResult<ItemOutcome> {
        if self.dedup.contains(edge, &msg.msg_id) {
            return Ok(ItemOutcome::Duplicate);
        }
        if self.store.is_applied(edge, &msg.msg_id)? {
            self.dedup.record(edge, msg.msg_id);
            return Ok(ItemOutcome::Duplicate);
        }

        let outcome = match self.apply(tenant, msg) {
            Ok(outcome) => outcome,
            Err(e) => ItemOutcome::Failed(e.to_string()),
        };

        match &outcome {
            ItemOutcome::Applied | ItemOutcome::Unchanged => {
                self.store.mark_applied(edge, msg.msg_id)?;
                self.dedup.record(edge, msg.msg_id);
            }
            ItemOutcome::Failed(reason) => {
                warn!(
                    edge_id = %edge,
                    msg_id = %msg.msg_id,
                    msg_type = ?msg.msg_type,
                    reason = %reason,
                    "uplink item failed"
                );
            }
            ItemOutcome::Duplicate => {}
        }
        Ok(outcome)
    }

    fn apply(&self, tenant: TenantId, msg: &SubMessage) -> ServerResult<ItemOutcome> {
        match (&msg.msg_type, &msg.payload) {
            (UpdateMsgType::EntityCreated | UpdateMsgType::EntityUpdated, UpdatePayload::Alarm(a)) => {
                self.upsert_alarm(tenant, a)
            }
            (UpdateMsgType::EntityCreated | UpdateMsgType::EntityUpdated, UpdatePayload::Entity(e)) => {
                self.upsert_entity(tenant, msg.originator_type, e)
            }
            (UpdateMsgType::EntityCreated | UpdateMsgType::EntityUpdated, UpdatePayload::None) => {
                Ok(failed("entity payload missing"))
            }
            (UpdateMsgType::EntityDeleted, UpdatePayload::Alarm(a)) => self.delete_alarm(tenant, a),
            (UpdateMsgType::EntityDeleted, _) => self.delete_entity(tenant, msg),
            (UpdateMsgType::AlarmAck, UpdatePayload::Alarm(a)) => self.ack_alarm(tenant, a),
            (UpdateMsgType::AlarmClear, UpdatePayload::Alarm(a)) => self.clear_alarm(tenant, a),
            (UpdateMsgType::AlarmAck | UpdateMsgType::AlarmClear, _) => {
                Ok(failed("alarm payload missing"))
            }
        }
    }

    fn upsert_entity(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        payload: &EntityPayload,
    ) -> ServerResult<ItemOutcome> {
        match self
            .store
            .find_entity_by_name(tenant, entity_type, &payload.name)?
        {
            Some(existing) if existing.kind == payload.kind && existing.body == payload.body => {
                Ok(ItemOutcome::Unchanged)
            }
            Some(existing) => {
                let id = existing.id;
                self.store.save_entity(EntityRecord {
                    kind: payload.kind.clone(),
                    body: payload.body.clone(),
                    ..existing
                })?;
                self.store.notify(Notification::EntityUpdated(id));
                Ok(ItemOutcome::Applied)
            }
            None => {
                let id = EntityId::new();
                self.store.save_entity(EntityRecord {
                    id,
                    tenant,
                    entity_type,
                    name: payload.name.clone(),
                    kind: payload.kind.clone(),
                    body: payload.body.clone(),
                })?;
                self.store.notify(Notification::EntityCreated(id));
                Ok(ItemOutcome::Applied)
            }
        }
    }

    fn delete_entity(&self, tenant: TenantId, msg: &SubMessage) -> ServerResult<ItemOutcome> {
        let found = match &msg.originator {
            OriginatorRef::Id(id) => self.store.find_entity(tenant, *id)?,
            OriginatorRef::Name(name) => {
                self.store
                    .find_entity_by_name(tenant, msg.originator_type, name)?
            }
        };
        let Some(entity) = found else {
            return Ok(ItemOutcome::Unchanged);
        };
        if self.store.delete_entity(tenant, entity.id)? {
            self.store.notify(Notification::EntityDeleted(entity.id));
            Ok(ItemOutcome::Applied)
        } else {
            Ok(ItemOutcome::Unchanged)
        }
    }

    fn originator(&self, tenant: TenantId, payload: &AlarmPayload) -> ServerResult<Option<EntityId>> {
        Ok(self
            .store
            .find_entity_by_name(tenant, payload.originator_type, &payload.originator_name)?
            .map(|e| e.id))
    }

    /// Resolves the alarm a payload refers to, or the reason it can't be.
    fn existing_alarm(
        &self,
        tenant: TenantId,
        payload: &AlarmPayload,
    ) -> ServerResult<Result<AlarmRecord, ItemOutcome>> {
        let Some(originator) = self.originator(tenant, payload)? else {
            return Ok(Err(missing_originator(payload)));
        };
        match self.store.find_alarm(tenant, originator, &payload.alarm_type)? {
            Some(alarm) => Ok(Ok(alarm)),
            None => Ok(Err(failed(format!(
                "no {} alarm on {}",
                payload.alarm_type, payload.originator_name
            )))),
        }
    }

    fn upsert_alarm(&self, tenant: TenantId, payload: &AlarmPayload) -> ServerResult<ItemOutcome> {
        let Some(originator) = self.originator(tenant, payload)? else {
            return Ok(missing_originator(payload));
        };
        match self.store.find_alarm(tenant, originator, &payload.alarm_type)? {
            Some(alarm)
                if alarm.status == payload.status
                    && alarm.severity == payload.severity
                    && alarm.details == payload.details =>
            {
                Ok(ItemOutcome::Unchanged)
            }
            Some(alarm) => {
                let id = alarm.id;
                self.store.save_alarm(AlarmRecord {
                    status: payload.status,
                    severity: payload.severity,
                    details: payload.details.clone(),
                    ..alarm
                })?;
                self.store
                    .notify(Notification::AlarmUpdated(id, payload.status));
                Ok(ItemOutcome::Applied)
            }
            None => {
                let id = EntityId::new();
                self.store.save_alarm(AlarmRecord {
                    id,
                    tenant,
                    originator,
                    alarm_type: payload.alarm_type.clone(),
                    status: payload.status,
                    severity: payload.severity,
                    details: payload.details.clone(),
                })?;
                self.store.notify(Notification::AlarmCreated(id));
                Ok(ItemOutcome::Applied)
            }
        }
    }

    fn ack_alarm(&self, tenant: TenantId, payload: &AlarmPayload) -> ServerResult<ItemOutcome> {
        let alarm = match self.existing_alarm(tenant, payload)? {
            Ok(alarm) => alarm,
            Err(outcome) => return Ok(outcome),
        };
        if alarm.status.is_ack() {
            return Ok(ItemOutcome::Unchanged);
        }
        self.set_status(alarm, |status| status.acknowledged())
    }

    fn clear_alarm(&self, tenant: TenantId, payload: &AlarmPayload) -> ServerResult<ItemOutcome> {
        let alarm = match self.existing_alarm(tenant, payload)? {
            Ok(alarm) => alarm,
            Err(outcome) => return Ok(outcome),
        };
        if alarm.status.is_cleared() {
            return Ok(ItemOutcome::Unchanged);
        }
        self.set_status(alarm, |status| status.cleared())
    }

    fn set_status(
        &self,
        alarm: AlarmRecord,
        next: impl FnOnce(AlarmStatus) -> AlarmStatus,
    ) -> ServerResult<ItemOutcome> {
        let id = alarm.id;
        let status = next(alarm.status);
        self.store.save_alarm(AlarmRecord { status, ..alarm })?;
        self.store.notify(Notification::AlarmUpdated(id, status));
        Ok(ItemOutcome::Applied)
    }

    fn delete_alarm(&self, tenant: TenantId, payload: &AlarmPayload) -> ServerResult<ItemOutcome> {
        let Some(originator) = self.originator(tenant, payload)? else {
            return Ok(ItemOutcome::Unchanged);
        };
        let Some(alarm) = self.store.find_alarm(tenant, originator, &payload.alarm_type)? else {
            return Ok(ItemOutcome::Unchanged);
        };
        if self.store.delete_alarm(tenant, alarm.id)? {
            self.store.notify(Notification::AlarmDeleted(alarm.id));
            Ok(ItemOutcome::Applied)
        } else {
            Ok(ItemOutcome::Unchanged)
        }
    }
}

fn failed(reason: impl Into<String>) -> ItemOutcome {
    ItemOutcome::Failed(reason.into())
}

fn missing_originator(payload: &AlarmPayload) -> ItemOutcome {
    failed(format!(
        "originator {} {} not found",
        payload.originator_type.as_str(),
        payload.originator_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPlatformStore;
    use edgesync_engine::NodeId;
    use edgesync_protocol::AlarmSeverity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryPlatformStore>,
        handler: UplinkHandler,
        tenant: TenantId,
        edge: EdgeId,
    }

    fn fixture(config: ServerConfig) -> Fixture {
        let store = Arc::new(MemoryPlatformStore::new());
        let router = Arc::new(PartitionRouter::standalone(NodeId::new("node-1")));
        let handler = UplinkHandler::new(store.clone(), router, config);
        Fixture {
            store,
            handler,
            tenant: TenantId::new(),
            edge: EdgeId::new(),
        }
    }

    fn device(name: &str, kind: &str) -> SubMessage {
        SubMessage::new(
            EntityType::Device,
            OriginatorRef::Name(name.into()),
            UpdateMsgType::EntityCreated,
            UpdatePayload::Entity(EntityPayload::new(name, kind)),
        )
    }

    fn alarm_msg(msg_type: UpdateMsgType, payload: AlarmPayload) -> SubMessage {
        SubMessage::new(
            EntityType::Alarm,
            OriginatorRef::Name(payload.originator_name.clone()),
            msg_type,
            UpdatePayload::Alarm(payload),
        )
    }

    fn outcomes(ack: &BatchAck) -> Vec<ItemOutcome> {
        ack.statuses.iter().map(|s| s.outcome.clone()).collect()
    }

    #[test]
    fn created_entity_matches_by_natural_key() {
        let f = fixture(ServerConfig::default());
        let batch = UplinkBatch::new(
            1,
            f.edge,
            vec![device("pump", "water"), device("pump", "water"), device("pump", "oil")],
        );

        let ack = f.handler.handle_batch(f.tenant, &batch).unwrap();

        assert!(ack.accepted);
        assert_eq!(
            outcomes(&ack),
            vec![ItemOutcome::Applied, ItemOutcome::Unchanged, ItemOutcome::Applied]
        );
        assert_eq!(f.store.entity_count(), 1);
        let pump = f
            .store
            .find_entity_by_name(f.tenant, EntityType::Device, "pump")
            .unwrap()
            .unwrap();
        assert_eq!(pump.kind, "oil");
        assert_eq!(
            f.store.notifications(),
            vec![
                Notification::EntityCreated(pump.id),
                Notification::EntityUpdated(pump.id)
            ]
        );
    }

    #[test]
    fn replayed_message_is_duplicate_without_side_effects() {
        let f = fixture(ServerConfig::default());
        let batch = UplinkBatch::new(1, f.edge, vec![device("fan", "hvac")]);

        f.handler.handle_batch(f.tenant, &batch).unwrap();
        let replay = f.handler.handle_batch(f.tenant, &batch).unwrap();

        assert_eq!(outcomes(&replay), vec![ItemOutcome::Duplicate]);
        assert_eq!(f.store.notifications().len(), 1);
    }

    #[test]
    fn restarted_handler_still_answers_replays_as_duplicates() {
        let f = fixture(ServerConfig::default());
        let raised = AlarmPayload::new("Overheat", EntityType::Device, "boiler", AlarmSeverity::Major);
        let batch = UplinkBatch::new(
            1,
            f.edge,
            vec![
                device("boiler", "water"),
                device("boiler", "oil"),
                alarm_msg(UpdateMsgType::EntityCreated, raised.clone()),
                alarm_msg(UpdateMsgType::AlarmAck, raised),
            ],
        );
        f.handler.handle_batch(f.tenant, &batch).unwrap();
        let before = f.store.notifications();
        assert_eq!(before.len(), 4);

        let restarted = UplinkHandler::new(
            f.store.clone(),
            Arc::new(PartitionRouter::standalone(NodeId::new("node-1"))),
            ServerConfig::default(),
        );
        let replay = restarted.handle_batch(f.tenant, &batch).unwrap();

        assert_eq!(outcomes(&replay), vec![ItemOutcome::Duplicate; 4]);
        assert_eq!(f.store.notifications(), before);
        let boiler = f
            .store
            .find_entity_by_name(f.tenant, EntityType::Device, "boiler")
            .unwrap()
            .unwrap();
        assert_eq!(boiler.kind, "oil");
    }

    /// Store whose applied-id writes fail a set number of times.
    struct UnreliableStore {
        inner: MemoryPlatformStore,
        failing_marks: AtomicUsize,
    }

    impl PlatformStore for UnreliableStore {
        fn find_entity_by_name(
            &self,
            tenant: TenantId,
            entity_type: EntityType,
            name: &str,
        ) -> ServerResult<Option<EntityRecord>> {
            self.inner.find_entity_by_name(tenant, entity_type, name)
        }

        fn find_entity(&self, tenant: TenantId, id: EntityId) -> ServerResult<Option<EntityRecord>> {
            self.inner.find_entity(tenant, id)
        }

        fn save_entity(&self, entity: EntityRecord) -> ServerResult<()> {
            self.inner.save_entity(entity)
        }

        fn delete_entity(&self, tenant: TenantId, id: EntityId) -> ServerResult<bool> {
            self.inner.delete_entity(tenant, id)
        }

        fn find_alarm(
            &self,
            tenant: TenantId,
            originator: EntityId,
            alarm_type: &str,
        ) -> ServerResult<Option<AlarmRecord>> {
            self.inner.find_alarm(tenant, originator, alarm_type)
        }

        fn save_alarm(&self, alarm: AlarmRecord) -> ServerResult<()> {
            self.inner.save_alarm(alarm)
        }

        fn delete_alarm(&self, tenant: TenantId, id: EntityId) -> ServerResult<bool> {
            self.inner.delete_alarm(tenant, id)
        }

        fn notify(&self, notification: Notification) {
            self.inner.notify(notification)
        }

        fn is_applied(&self, edge: EdgeId, msg_id: &Uuid) -> ServerResult<bool> {
            self.inner.is_applied(edge, msg_id)
        }

        fn mark_applied(&self, edge: EdgeId, msg_id: Uuid) -> ServerResult<()> {
            let failing = self
                .failing_marks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ServerError::Store("applied log unavailable".into()));
            }
            self.inner.mark_applied(edge, msg_id)
        }

        fn forget_applied(&self, edge: EdgeId) -> ServerResult<()> {
            self.inner.forget_applied(edge)
        }
    }

    #[test]
    fn unrecorded_item_is_not_applied_twice_on_redelivery() {
        let store = Arc::new(UnreliableStore {
            inner: MemoryPlatformStore::new(),
            failing_marks: AtomicUsize::new(1),
        });
        let handler = UplinkHandler::new(
            store.clone(),
            Arc::new(PartitionRouter::standalone(NodeId::new("node-1"))),
            ServerConfig::default(),
        );
        let (tenant, edge) = (TenantId::new(), EdgeId::new());
        let batch = UplinkBatch::new(1, edge, vec![device("valve", "gas"), device("meter", "gas")]);

        let err = handler.handle_batch(tenant, &batch).unwrap_err();
        assert!(err.is_server_error());

        let ack = handler.handle_batch(tenant, &batch).unwrap();
        assert_eq!(outcomes(&ack), vec![ItemOutcome::Unchanged, ItemOutcome::Applied]);
        assert_eq!(store.inner.notifications().len(), 2);
    }

    #[test]
    fn forgotten_edge_replays_apply_again() {
        let f = fixture(ServerConfig::default());
        let batch = UplinkBatch::new(1, f.edge, vec![device("fan", "hvac")]);
        f.handler.handle_batch(f.tenant, &batch).unwrap();

        f.handler.forget_edge(f.edge).unwrap();
        let replay = f.handler.handle_batch(f.tenant, &batch).unwrap();
        assert_eq!(outcomes(&replay), vec![ItemOutcome::Unchanged]);
    }

    #[test]
    fn delete_of_absent_entity_is_unchanged() {
        let f = fixture(ServerConfig::default());
        let delete = SubMessage::new(
            EntityType::Asset,
            OriginatorRef::Name("ghost".into()),
            UpdateMsgType::EntityDeleted,
            UpdatePayload::None,
        );
        let ack = f
            .handler
            .handle_batch(f.tenant, &UplinkBatch::new(1, f.edge, vec![delete]))
            .unwrap();

        assert_eq!(outcomes(&ack), vec![ItemOutcome::Unchanged]);
        assert!(f.store.notifications().is_empty());
    }

    #[test]
    fn ack_and_clear_are_noops_when_already_in_state() {
        let f = fixture(ServerConfig::default());
        let raised = AlarmPayload::new("Overheat", EntityType::Device, "boiler", AlarmSeverity::Major);
        let batch = UplinkBatch::new(
            1,
            f.edge,
            vec![
                device("boiler", "heating"),
                alarm_msg(UpdateMsgType::EntityCreated, raised.clone()),
                alarm_msg(UpdateMsgType::AlarmAck, raised.clone()),
                alarm_msg(UpdateMsgType::AlarmAck, raised.clone()),
                alarm_msg(UpdateMsgType::AlarmClear, raised.clone()),
                alarm_msg(UpdateMsgType::AlarmClear, raised.clone()),
            ],
        );

        let ack = f.handler.handle_batch(f.tenant, &batch).unwrap();

        assert_eq!(
            outcomes(&ack),
            vec![
                ItemOutcome::Applied,
                ItemOutcome::Applied,
                ItemOutcome::Applied,
                ItemOutcome::Unchanged,
                ItemOutcome::Applied,
                ItemOutcome::Unchanged,
            ]
        );
        let alarms = f.store.alarms(f.tenant);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].status, AlarmStatus::ClearedAck);
    }

    #[test]
    fn missing_originator_fails_only_that_item() {
        let f = fixture(ServerConfig::default());
        let orphan = AlarmPayload::new("Offline", EntityType::Device, "nowhere", AlarmSeverity::Minor);
        let batch = UplinkBatch::new(
            7,
            f.edge,
            vec![alarm_msg(UpdateMsgType::EntityCreated, orphan.clone()), device("valve", "gas")],
        );

        let ack = f.handler.handle_batch(f.tenant, &batch).unwrap();

        assert!(ack.accepted);
        assert_eq!(ack.batch_id, 7);
        assert!(matches!(ack.statuses[0].outcome, ItemOutcome::Failed(_)));
        assert_eq!(ack.statuses[1].outcome, ItemOutcome::Applied);

        // failed items are not remembered
        f.handler
            .handle_batch(f.tenant, &UplinkBatch::new(8, f.edge, vec![device("nowhere", "x")]))
            .unwrap();
        let retry = f.handler.handle_batch(f.tenant, &batch).unwrap();
        assert_eq!(
            outcomes(&retry),
            vec![ItemOutcome::Applied, ItemOutcome::Duplicate]
        );
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let f = fixture(ServerConfig::new().with_max_batch_messages(1));
        let batch = UplinkBatch::new(1, f.edge, vec![device("a", "x"), device("b", "x")]);

        let err = f.handler.handle_batch(f.tenant, &batch).unwrap_err();
        assert!(matches!(err, ServerError::InvalidBatch(_)));
        assert_eq!(f.store.entity_count(), 0);
    }

    #[test]
    fn foreign_edge_is_not_owned() {
        let store = Arc::new(MemoryPlatformStore::new());
        let router = Arc::new(PartitionRouter::new(
            NodeId::new("outsider"),
            edgesync_engine::RouterConfig::default(),
            edgesync_engine::ClusterTopology::single(NodeId::new("leader")),
        ));
        let handler = UplinkHandler::new(store, router, ServerConfig::default());
        let edge = EdgeId::new();

        let err = handler
            .handle_batch(TenantId::new(), &UplinkBatch::new(1, edge, vec![]))
            .unwrap_err();
        assert!(matches!(err, ServerError::NotOwner { edge: e } if e == edge));
    }
}
