//! Wire messages exchanged between the platform and an edge.
//!
//! Every frame is `[type code][CBOR body]`:
//!
//! | Code | Message |
//! |------|---------|
//! | 1 | [`DownlinkBatch`] |
//! | 2 | [`UplinkBatch`] |
//! | 3 | [`BatchAck`] |
//! | 4 | [`ProtocolErrorFrame`] |

use crate::alarm::{AlarmSeverity, AlarmStatus};
use crate::codec::{decode_value, encode_value, Fields, MapBuilder};
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{EdgeEvent, EdgeEventAction, EntityType};
use crate::ids::{EdgeId, EntityId};
use ciborium::value::Value;
use uuid::Uuid;

/// Kind of change carried by a sub-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateMsgType {
    /// Entity created (or upserted).
    EntityCreated,
    /// Entity updated.
    EntityUpdated,
    /// Entity deleted.
    EntityDeleted,
    /// Alarm acknowledged.
    AlarmAck,
    /// Alarm cleared.
    AlarmClear,
}

impl UpdateMsgType {
    /// Converts to a numeric code for CBOR encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            UpdateMsgType::EntityCreated => 1,
            UpdateMsgType::EntityUpdated => 2,
            UpdateMsgType::EntityDeleted => 3,
            UpdateMsgType::AlarmAck => 4,
            UpdateMsgType::AlarmClear => 5,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(UpdateMsgType::EntityCreated),
            2 => Some(UpdateMsgType::EntityUpdated),
            3 => Some(UpdateMsgType::EntityDeleted),
            4 => Some(UpdateMsgType::AlarmAck),
            5 => Some(UpdateMsgType::AlarmClear),
            _ => None,
        }
    }

    /// Message type used to ship an event with the given action.
    pub fn for_action(action: EdgeEventAction) -> Self {
        match action {
            EdgeEventAction::Added | EdgeEventAction::AssignedToEdge => {
                UpdateMsgType::EntityCreated
            }
            EdgeEventAction::Updated | EdgeEventAction::CredentialsUpdated => {
                UpdateMsgType::EntityUpdated
            }
            EdgeEventAction::Deleted | EdgeEventAction::UnassignedFromEdge => {
                UpdateMsgType::EntityDeleted
            }
            EdgeEventAction::AlarmAck => UpdateMsgType::AlarmAck,
            EdgeEventAction::AlarmClear => UpdateMsgType::AlarmClear,
        }
    }
}

/// How a sub-message identifies its originator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OriginatorRef {
    /// By platform id.
    Id(EntityId),
    /// By natural key (name, scoped by type and tenant).
    Name(String),
}

/// Snapshot of a regular entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPayload {
    /// Entity name, unique per tenant and type.
    pub name: String,
    /// Entity subtype, e.g. a device profile name.
    pub kind: String,
    /// Opaque attributes.
    pub body: Option<Vec<u8>>,
}

impl EntityPayload {
    /// Creates a payload without attributes.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            body: None,
        }
    }

    /// Sets the opaque attributes.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    fn to_value(&self) -> Value {
        MapBuilder::new()
            .text("name", self.name.as_str())
            .text("kind", self.kind.as_str())
            .opt_bytes("body", self.body.as_deref())
            .build()
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "EntityPayload")?;
        Ok(Self {
            name: fields.text("name")?.to_string(),
            kind: fields.opt_text("kind")?.unwrap_or_default().to_string(),
            body: fields.opt_bytes("body")?.map(<[u8]>::to_vec),
        })
    }

    /// Encodes for use as an event body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_value(&self.to_value())
    }

    /// Decodes an event body.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Self::from_value(&decode_value(bytes)?)
    }
}

/// Snapshot of an alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmPayload {
    /// Alarm type, unique per originator among open alarms.
    pub alarm_type: String,
    /// Type of the entity that raised the alarm.
    pub originator_type: EntityType,
    /// Name of the entity that raised the alarm.
    pub originator_name: String,
    /// Current status.
    pub status: AlarmStatus,
    /// Severity.
    pub severity: AlarmSeverity,
    /// Opaque details.
    pub details: Option<Vec<u8>>,
}

impl AlarmPayload {
    /// Creates a freshly raised alarm snapshot.
    pub fn new(
        alarm_type: impl Into<String>,
        originator_type: EntityType,
        originator_name: impl Into<String>,
        severity: AlarmSeverity,
    ) -> Self {
        Self {
            alarm_type: alarm_type.into(),
            originator_type,
            originator_name: originator_name.into(),
            status: AlarmStatus::ActiveUnack,
            severity,
            details: None,
        }
    }

    /// Returns a copy with the given status.
    pub fn with_status(mut self, status: AlarmStatus) -> Self {
        self.status = status;
        self
    }

    fn to_value(&self) -> Value {
        MapBuilder::new()
            .text("alarm_type", self.alarm_type.as_str())
            .code("originator_type", self.originator_type.to_code())
            .text("originator_name", self.originator_name.as_str())
            .text("status", self.status.as_str())
            .text("severity", self.severity.as_str())
            .opt_bytes("details", self.details.as_deref())
            .build()
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "AlarmPayload")?;
        let status = fields.text("status")?;
        let severity = fields.text("severity")?;
        Ok(Self {
            alarm_type: fields.text("alarm_type")?.to_string(),
            originator_type: fields.code("originator_type", EntityType::from_code)?,
            originator_name: fields.text("originator_name")?.to_string(),
            status: AlarmStatus::parse(status).ok_or_else(|| {
                ProtocolError::invalid("AlarmPayload", format!("unknown status {status}"))
            })?,
            severity: AlarmSeverity::parse(severity).ok_or_else(|| {
                ProtocolError::invalid("AlarmPayload", format!("unknown severity {severity}"))
            })?,
            details: fields.opt_bytes("details")?.map(<[u8]>::to_vec),
        })
    }

    /// Encodes for use as an event body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_value(&self.to_value())
    }

    /// Decodes an event body.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Self::from_value(&decode_value(bytes)?)
    }
}

/// Type-specific payload of a sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePayload {
    /// No payload; the originator reference is enough.
    None,
    /// Regular entity snapshot.
    Entity(EntityPayload),
    /// Alarm snapshot.
    Alarm(AlarmPayload),
}

impl UpdatePayload {
    fn to_value(&self) -> Value {
        match self {
            UpdatePayload::None => MapBuilder::new().code("kind", 0).build(),
            UpdatePayload::Entity(p) => MapBuilder::new()
                .code("kind", 1)
                .value("entity", p.to_value())
                .build(),
            UpdatePayload::Alarm(p) => MapBuilder::new()
                .code("kind", 2)
                .value("alarm", p.to_value())
                .build(),
        }
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "UpdatePayload")?;
        match fields.uint("kind")? {
            0 => Ok(UpdatePayload::None),
            1 => Ok(UpdatePayload::Entity(EntityPayload::from_value(
                fields.value("entity")?,
            )?)),
            2 => Ok(UpdatePayload::Alarm(AlarmPayload::from_value(
                fields.value("alarm")?,
            )?)),
            code => Err(ProtocolError::UnknownCode {
                context: "UpdatePayload",
                field: "kind".into(),
                code,
            }),
        }
    }
}

/// One typed change inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessage {
    /// Stable per-event identifier used for deduplication.
    pub msg_id: Uuid,
    /// Type of the originator.
    pub originator_type: EntityType,
    /// Originator reference.
    pub originator: OriginatorRef,
    /// Kind of change.
    pub msg_type: UpdateMsgType,
    /// Payload.
    pub payload: UpdatePayload,
}

impl SubMessage {
    /// Creates a sub-message with a fresh identifier.
    pub fn new(
        originator_type: EntityType,
        originator: OriginatorRef,
        msg_type: UpdateMsgType,
        payload: UpdatePayload,
    ) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            originator_type,
            originator,
            msg_type,
            payload,
        }
    }

    /// Builds the downlink sub-message for a queued event.
    ///
    /// The event uid becomes the message id, so redelivery of the same
    /// event is recognisable downstream.
    pub fn from_event(event: &EdgeEvent) -> ProtocolResult<Self> {
        let msg_type = UpdateMsgType::for_action(event.action);

        if event.entity_type == EntityType::Alarm {
            let body = event
                .body
                .as_deref()
                .ok_or_else(|| ProtocolError::missing("EdgeEvent", "body"))?;
            let alarm = AlarmPayload::decode(body)?;
            return Ok(Self {
                msg_id: event.uid,
                originator_type: alarm.originator_type,
                originator: OriginatorRef::Name(alarm.originator_name.clone()),
                msg_type,
                payload: UpdatePayload::Alarm(alarm),
            });
        }

        let payload = match event.body.as_deref() {
            Some(body) => UpdatePayload::Entity(EntityPayload::decode(body)?),
            None => UpdatePayload::None,
        };
        Ok(Self {
            msg_id: event.uid,
            originator_type: event.entity_type,
            originator: OriginatorRef::Id(event.entity_id),
            msg_type,
            payload,
        })
    }

    fn to_value(&self) -> Value {
        let builder = MapBuilder::new()
            .uuid("msg_id", self.msg_id)
            .code("originator_type", self.originator_type.to_code())
            .code("msg_type", self.msg_type.to_code());
        let builder = match &self.originator {
            OriginatorRef::Id(id) => builder.uuid("originator_id", id.as_uuid()),
            OriginatorRef::Name(name) => builder.text("originator_name", name.as_str()),
        };
        builder.value("payload", self.payload.to_value()).build()
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "SubMessage")?;
        let originator = match fields.opt_text("originator_name")? {
            Some(name) => OriginatorRef::Name(name.to_string()),
            None => OriginatorRef::Id(EntityId::from_uuid(fields.uuid("originator_id")?)),
        };
        Ok(Self {
            msg_id: fields.uuid("msg_id")?,
            originator_type: fields.code("originator_type", EntityType::from_code)?,
            originator,
            msg_type: fields.code("msg_type", UpdateMsgType::from_code)?,
            payload: UpdatePayload::from_value(fields.value("payload")?)?,
        })
    }
}

fn messages_to_values(messages: &[SubMessage]) -> Vec<Value> {
    messages.iter().map(SubMessage::to_value).collect()
}

fn messages_from_values(values: &[Value]) -> ProtocolResult<Vec<SubMessage>> {
    values.iter().map(SubMessage::from_value).collect()
}

/// Batch of queued events sent to an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkBatch {
    /// Batch identifier, echoed by the ack.
    pub batch_id: u64,
    /// Target edge.
    pub edge_id: EdgeId,
    /// Sequence id of the first event.
    pub first_seq: u64,
    /// Sequence id of the last event; the cursor moves here on ack.
    pub last_seq: u64,
    /// Sub-messages in sequence order.
    pub messages: Vec<SubMessage>,
}

impl DownlinkBatch {
    /// Builds a batch from a contiguous outbox read.
    ///
    /// Returns an error for an empty slice.
    pub fn from_events(batch_id: u64, edge_id: EdgeId, events: &[EdgeEvent]) -> ProtocolResult<Self> {
        let (first, last) = match (events.first(), events.last()) {
            (Some(first), Some(last)) => (first.seq, last.seq),
            _ => return Err(ProtocolError::invalid("DownlinkBatch", "empty batch")),
        };
        let messages = events
            .iter()
            .map(SubMessage::from_event)
            .collect::<ProtocolResult<Vec<_>>>()?;
        Ok(Self {
            batch_id,
            edge_id,
            first_seq: first,
            last_seq: last,
            messages,
        })
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let value = MapBuilder::new()
            .uint("batch_id", self.batch_id)
            .uuid("edge_id", self.edge_id.as_uuid())
            .uint("first_seq", self.first_seq)
            .uint("last_seq", self.last_seq)
            .array("messages", messages_to_values(&self.messages))
            .build();
        encode_value(&value)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = decode_value(bytes)?;
        let fields = Fields::of(&value, "DownlinkBatch")?;
        let batch = Self {
            batch_id: fields.uint("batch_id")?,
            edge_id: EdgeId::from_uuid(fields.uuid("edge_id")?),
            first_seq: fields.uint("first_seq")?,
            last_seq: fields.uint("last_seq")?,
            messages: messages_from_values(fields.array("messages")?)?,
        };
        if batch.first_seq > batch.last_seq {
            return Err(ProtocolError::invalid(
                "DownlinkBatch",
                "first_seq after last_seq",
            ));
        }
        Ok(batch)
    }
}

/// Batch of edge-originated changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkBatch {
    /// Batch identifier, increasing per edge session.
    pub batch_id: u64,
    /// Originating edge.
    pub edge_id: EdgeId,
    /// Sub-messages in the order they must be applied.
    pub messages: Vec<SubMessage>,
}

impl UplinkBatch {
    /// Creates a batch.
    pub fn new(batch_id: u64, edge_id: EdgeId, messages: Vec<SubMessage>) -> Self {
        Self {
            batch_id,
            edge_id,
            messages,
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let value = MapBuilder::new()
            .uint("batch_id", self.batch_id)
            .uuid("edge_id", self.edge_id.as_uuid())
            .array("messages", messages_to_values(&self.messages))
            .build();
        encode_value(&value)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = decode_value(bytes)?;
        let fields = Fields::of(&value, "UplinkBatch")?;
        Ok(Self {
            batch_id: fields.uint("batch_id")?,
            edge_id: EdgeId::from_uuid(fields.uuid("edge_id")?),
            messages: messages_from_values(fields.array("messages")?)?,
        })
    }
}

/// Result of applying one sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// State changed.
    Applied,
    /// Already in the requested state.
    Unchanged,
    /// Message id seen before; skipped.
    Duplicate,
    /// Could not be applied.
    Failed(String),
}

/// Per-item entry of an ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStatus {
    /// Sub-message id.
    pub msg_id: Uuid,
    /// Outcome.
    pub outcome: ItemOutcome,
}

impl ItemStatus {
    fn to_value(&self) -> Value {
        let builder = MapBuilder::new().uuid("msg_id", self.msg_id);
        let builder = match &self.outcome {
            ItemOutcome::Applied => builder.code("outcome", 0),
            ItemOutcome::Unchanged => builder.code("outcome", 1),
            ItemOutcome::Duplicate => builder.code("outcome", 2),
            ItemOutcome::Failed(reason) => {
                builder.code("outcome", 3).text("reason", reason.as_str())
            }
        };
        builder.build()
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "ItemStatus")?;
        let outcome = match fields.uint("outcome")? {
            0 => ItemOutcome::Applied,
            1 => ItemOutcome::Unchanged,
            2 => ItemOutcome::Duplicate,
            3 => ItemOutcome::Failed(fields.opt_text("reason")?.unwrap_or_default().to_string()),
            code => {
                return Err(ProtocolError::UnknownCode {
                    context: "ItemStatus",
                    field: "outcome".into(),
                    code,
                })
            }
        };
        Ok(Self {
            msg_id: fields.uuid("msg_id")?,
            outcome,
        })
    }
}

/// Acknowledgment of a batch, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAck {
    /// Identifier of the acknowledged batch.
    pub batch_id: u64,
    /// For downlink acks, the last sequence id the edge has applied.
    pub last_seq: Option<u64>,
    /// False for a negative acknowledgment.
    pub accepted: bool,
    /// Per-item outcomes, possibly empty.
    pub statuses: Vec<ItemStatus>,
    /// Reason for a negative acknowledgment.
    pub error: Option<String>,
}

impl BatchAck {
    /// Positive ack for a downlink batch.
    pub fn delivered(batch_id: u64, last_seq: u64) -> Self {
        Self {
            batch_id,
            last_seq: Some(last_seq),
            accepted: true,
            statuses: Vec::new(),
            error: None,
        }
    }

    /// Positive ack for a processed uplink batch.
    pub fn processed(batch_id: u64, statuses: Vec<ItemStatus>) -> Self {
        Self {
            batch_id,
            last_seq: None,
            accepted: true,
            statuses,
            error: None,
        }
    }

    /// Negative ack.
    pub fn rejected(batch_id: u64, reason: impl Into<String>) -> Self {
        Self {
            batch_id,
            last_seq: None,
            accepted: false,
            statuses: Vec::new(),
            error: Some(reason.into()),
        }
    }

    /// Items that failed to apply.
    pub fn failures(&self) -> impl Iterator<Item = &ItemStatus> {
        self.statuses
            .iter()
            .filter(|s| matches!(s.outcome, ItemOutcome::Failed(_)))
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let value = MapBuilder::new()
            .uint("batch_id", self.batch_id)
            .opt_uint("last_seq", self.last_seq)
            .bool("accepted", self.accepted)
            .array(
                "statuses",
                self.statuses.iter().map(ItemStatus::to_value).collect(),
            )
            .opt_text("error", self.error.as_deref())
            .build();
        encode_value(&value)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = decode_value(bytes)?;
        let fields = Fields::of(&value, "BatchAck")?;
        Ok(Self {
            batch_id: fields.uint("batch_id")?,
            last_seq: fields.opt_uint("last_seq")?,
            accepted: fields.bool_or("accepted", false),
            statuses: fields
                .array("statuses")?
                .iter()
                .map(ItemStatus::from_value)
                .collect::<ProtocolResult<Vec<_>>>()?,
            error: fields.opt_text("error")?.map(str::to_string),
        })
    }
}

/// Response to a malformed or out-of-order frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolErrorFrame {
    /// Batch id of the offending frame, if it could be read.
    pub batch_id: Option<u64>,
    /// What was wrong.
    pub reason: String,
}

impl ProtocolErrorFrame {
    /// Creates an error frame.
    pub fn new(batch_id: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            batch_id,
            reason: reason.into(),
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let value = MapBuilder::new()
            .opt_uint("batch_id", self.batch_id)
            .text("reason", self.reason.as_str())
            .build();
        encode_value(&value)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = decode_value(bytes)?;
        let fields = Fields::of(&value, "ProtocolErrorFrame")?;
        Ok(Self {
            batch_id: fields.opt_uint("batch_id")?,
            reason: fields.text("reason")?.to_string(),
        })
    }
}

/// Any frame on the sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Platform to edge.
    Downlink(DownlinkBatch),
    /// Edge to platform.
    Uplink(UplinkBatch),
    /// Acknowledgment.
    Ack(BatchAck),
    /// Protocol violation report.
    Error(ProtocolErrorFrame),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::Downlink(_) => 1,
            SyncMessage::Uplink(_) => 2,
            SyncMessage::Ack(_) => 3,
            SyncMessage::Error(_) => 4,
        }
    }

    /// Encodes as a `[type][body]` frame.
    pub fn encode_frame(&self) -> ProtocolResult<Vec<u8>> {
        let body = match self {
            SyncMessage::Downlink(m) => m.encode()?,
            SyncMessage::Uplink(m) => m.encode()?,
            SyncMessage::Ack(m) => m.encode()?,
            SyncMessage::Error(m) => m.encode()?,
        };
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(self.type_code());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a `[type][body]` frame.
    pub fn decode_frame(frame: &[u8]) -> ProtocolResult<Self> {
        let (&code, body) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match code {
            1 => DownlinkBatch::decode(body).map(SyncMessage::Downlink),
            2 => UplinkBatch::decode(body).map(SyncMessage::Uplink),
            3 => BatchAck::decode(body).map(SyncMessage::Ack),
            4 => ProtocolErrorFrame::decode(body).map(SyncMessage::Error),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}
