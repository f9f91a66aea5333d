//! End-to-end uplink tests: edge-side capture through frames into the platform store.

use edgesync_engine::{ChangeCapture, NodeId, PartitionRouter, StaticAssignments, TrackedAlarm};
use edgesync_outbox::{EventOutbox, MemoryStorage};
use edgesync_protocol::{
    AlarmPayload, AlarmSeverity, AlarmStatus, EdgeEventAction, EdgeId, EntityId, EntityPayload,
    EntityType, ItemOutcome, OriginatorRef, SubMessage, SyncMessage, TenantId, UpdateMsgType,
    UpdatePayload, UplinkBatch,
};
use edgesync_server::{
    MemoryPlatformStore, Notification, PlatformStore, ServerConfig, UplinkHandler, UplinkSession,
};
use std::sync::Arc;

/// Edge-side producer: captures local changes into a queue and ships them as uplink frames.
struct EdgeSide {
    tenant: TenantId,
    edge: EdgeId,
    outbox: Arc<EventOutbox>,
    assignments: Arc<StaticAssignments>,
    capture: ChangeCapture,
    next_batch: u64,
}

impl EdgeSide {
    fn new(tenant: TenantId, edge: EdgeId) -> Self {
        let outbox = Arc::new(EventOutbox::open(Arc::new(MemoryStorage::new())).unwrap());
        let assignments = Arc::new(StaticAssignments::new());
        let capture = ChangeCapture::new(outbox.clone(), assignments.clone());
        Self {
            tenant,
            edge,
            outbox,
            assignments,
            capture,
            next_batch: 1,
        }
    }

    fn add_device(&self, name: &str, kind: &str) -> EntityId {
        let id = EntityId::new();
        self.assignments.assign(self.tenant, id, self.edge);
        let body = EntityPayload::new(name, kind).encode().unwrap();
        self.capture
            .record(self.tenant, EntityType::Device, EdgeEventAction::Added, id, Some(body))
            .unwrap();
        id
    }

    /// Drains the queue into one uplink batch.
    fn take_batch(&mut self) -> UplinkBatch {
        let events = self.outbox.read_pending(self.edge, 100).unwrap();
        if let Some(last) = events.last() {
            self.outbox.acknowledge(self.edge, last.seq).unwrap();
        }
        let messages = events
            .iter()
            .map(|e| SubMessage::from_event(e).unwrap())
            .collect();
        let batch = UplinkBatch::new(self.next_batch, self.edge, messages);
        self.next_batch += 1;
        batch
    }
}

fn platform() -> (Arc<MemoryPlatformStore>, Arc<UplinkHandler>) {
    let store = Arc::new(MemoryPlatformStore::new());
    let router = Arc::new(PartitionRouter::standalone(NodeId::new("platform-1")));
    let handler = Arc::new(UplinkHandler::new(
        store.clone(),
        router,
        ServerConfig::default(),
    ));
    (store, handler)
}

fn send(session: &mut UplinkSession, batch: &UplinkBatch) -> Vec<ItemOutcome> {
    let frame = SyncMessage::Uplink(batch.clone()).encode_frame().unwrap();
    let reply = session.handle_frame(&frame).unwrap();
    match SyncMessage::decode_frame(&reply.frame).unwrap() {
        SyncMessage::Ack(ack) => {
            assert_eq!(ack.batch_id, batch.batch_id);
            assert!(ack.accepted);
            ack.statuses.into_iter().map(|s| s.outcome).collect()
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

fn single(batch: &UplinkBatch) -> &SubMessage {
    assert_eq!(batch.messages.len(), 1);
    &batch.messages[0]
}

fn expect_alarm(msg: &SubMessage, msg_type: UpdateMsgType, status: AlarmStatus) {
    assert_eq!(msg.msg_type, msg_type);
    assert_eq!(msg.originator, OriginatorRef::Name("boiler".into()));
    match &msg.payload {
        UpdatePayload::Alarm(alarm) => {
            assert_eq!(alarm.status, status);
            assert_eq!(alarm.severity, AlarmSeverity::Critical);
            assert_eq!(alarm.originator_name, "boiler");
        }
        other => panic!("expected alarm payload, got {other:?}"),
    }
}

#[test]
fn alarm_lifecycle_flows_one_message_per_step() {
    let tenant = TenantId::new();
    let edge_id = EdgeId::new();
    let (store, handler) = platform();
    let mut session = UplinkSession::new(handler, tenant, edge_id);
    let mut edge = EdgeSide::new(tenant, edge_id);

    let boiler = edge.add_device("boiler", "heating");
    let batch = edge.take_batch();
    assert_eq!(send(&mut session, &batch), vec![ItemOutcome::Applied]);

    let mut alarm = TrackedAlarm {
        tenant,
        id: EntityId::new(),
        originator_id: boiler,
        payload: AlarmPayload::new("Overheat", EntityType::Device, "boiler", AlarmSeverity::Critical),
    };

    edge.capture.alarm_created(&alarm).unwrap();
    let batch = edge.take_batch();
    expect_alarm(single(&batch), UpdateMsgType::EntityCreated, AlarmStatus::ActiveUnack);
    assert_eq!(send(&mut session, &batch), vec![ItemOutcome::Applied]);
    assert_eq!(store.alarms(tenant)[0].status, AlarmStatus::ActiveUnack);

    edge.capture.alarm_acknowledged(&mut alarm).unwrap();
    let batch = edge.take_batch();
    expect_alarm(single(&batch), UpdateMsgType::AlarmAck, AlarmStatus::ActiveAck);
    assert_eq!(send(&mut session, &batch), vec![ItemOutcome::Applied]);
    assert_eq!(store.alarms(tenant)[0].status, AlarmStatus::ActiveAck);

    edge.capture.alarm_cleared(&mut alarm).unwrap();
    let batch = edge.take_batch();
    expect_alarm(single(&batch), UpdateMsgType::AlarmClear, AlarmStatus::ClearedAck);
    assert_eq!(send(&mut session, &batch), vec![ItemOutcome::Applied]);
    assert_eq!(store.alarms(tenant)[0].status, AlarmStatus::ClearedAck);

    edge.capture.alarm_deleted(&alarm).unwrap();
    let batch = edge.take_batch();
    expect_alarm(single(&batch), UpdateMsgType::EntityDeleted, AlarmStatus::ClearedAck);
    assert_eq!(send(&mut session, &batch), vec![ItemOutcome::Applied]);
    assert!(store.alarms(tenant).is_empty());

    let notifications = store.notifications();
    assert_eq!(notifications.len(), 5);
    assert!(matches!(notifications[1], Notification::AlarmCreated(_)));
    assert!(matches!(
        notifications[2],
        Notification::AlarmUpdated(_, AlarmStatus::ActiveAck)
    ));
    assert!(matches!(
        notifications[3],
        Notification::AlarmUpdated(_, AlarmStatus::ClearedAck)
    ));
    assert!(matches!(notifications[4], Notification::AlarmDeleted(_)));
}

#[test]
fn mixed_batch_is_processed_with_item_failure() {
    let tenant = TenantId::new();
    let edge_id = EdgeId::new();
    let (store, handler) = platform();
    let mut session = UplinkSession::new(handler, tenant, edge_id);

    let orphan_alarm = SubMessage::new(
        EntityType::Device,
        OriginatorRef::Name("missing".into()),
        UpdateMsgType::EntityCreated,
        UpdatePayload::Alarm(AlarmPayload::new(
            "Offline",
            EntityType::Device,
            "missing",
            AlarmSeverity::Warning,
        )),
    );
    let device = SubMessage::new(
        EntityType::Device,
        OriginatorRef::Name("meter".into()),
        UpdateMsgType::EntityCreated,
        UpdatePayload::Entity(EntityPayload::new("meter", "power")),
    );
    let batch = UplinkBatch::new(1, edge_id, vec![device, orphan_alarm]);

    let outcomes = send(&mut session, &batch);

    assert_eq!(outcomes[0], ItemOutcome::Applied);
    assert!(matches!(&outcomes[1], ItemOutcome::Failed(reason) if reason.contains("missing")));
    assert!(store
        .find_entity_by_name(tenant, EntityType::Device, "meter")
        .unwrap()
        .is_some());
    assert!(store.alarms(tenant).is_empty());
    assert_eq!(session.violations(), 0);
}

#[test]
fn redelivered_batch_has_no_second_effect() {
    let tenant = TenantId::new();
    let edge_id = EdgeId::new();
    let (store, handler) = platform();
    let mut session = UplinkSession::new(handler.clone(), tenant, edge_id);
    let mut edge = EdgeSide::new(tenant, edge_id);

    edge.add_device("gate", "access");
    edge.add_device("lamp", "lighting");
    let batch = edge.take_batch();

    assert_eq!(
        send(&mut session, &batch),
        vec![ItemOutcome::Applied, ItemOutcome::Applied]
    );
    let after_first = store.notifications();

    // the edge lost the ack and resends on a fresh connection
    let mut reconnected = UplinkSession::new(handler, tenant, edge_id);
    assert_eq!(
        send(&mut reconnected, &batch),
        vec![ItemOutcome::Duplicate, ItemOutcome::Duplicate]
    );
    assert_eq!(store.notifications(), after_first);
    assert_eq!(store.entity_count(), 2);
}

#[test]
fn replay_after_platform_restart_has_no_second_effect() {
    let tenant = TenantId::new();
    let edge_id = EdgeId::new();
    let (store, handler) = platform();
    let mut session = UplinkSession::new(handler, tenant, edge_id);
    let mut edge = EdgeSide::new(tenant, edge_id);

    edge.add_device("boiler", "water");
    edge.add_device("boiler", "oil");
    let batch = edge.take_batch();
    assert_eq!(
        send(&mut session, &batch),
        vec![ItemOutcome::Applied, ItemOutcome::Applied]
    );
    let after_first = store.notifications();
    drop(session);

    // new handler over the same store, as after a platform process restart
    let restarted = Arc::new(UplinkHandler::new(
        store.clone(),
        Arc::new(PartitionRouter::standalone(NodeId::new("platform-1"))),
        ServerConfig::default(),
    ));
    let mut session = UplinkSession::new(restarted, tenant, edge_id);
    assert_eq!(
        send(&mut session, &batch),
        vec![ItemOutcome::Duplicate, ItemOutcome::Duplicate]
    );

    assert_eq!(store.notifications(), after_first);
    let boiler = store
        .find_entity_by_name(tenant, EntityType::Device, "boiler")
        .unwrap()
        .unwrap();
    assert_eq!(boiler.kind, "oil");
}
