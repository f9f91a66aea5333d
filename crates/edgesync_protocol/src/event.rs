//! Edge events: the unit of change queued for one edge.

use crate::codec::{decode_value, encode_value, Fields, MapBuilder};
use crate::error::ProtocolResult;
use crate::ids::{EdgeId, EntityId, TenantId};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Type of the entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    /// Device.
    Device,
    /// Asset.
    Asset,
    /// Entity view.
    EntityView,
    /// Dashboard.
    Dashboard,
    /// Alarm.
    Alarm,
    /// Customer.
    Customer,
    /// Rule chain.
    RuleChain,
    /// Widgets bundle.
    WidgetsBundle,
    /// The edge itself.
    Edge,
}

impl EntityType {
    /// Converts to a numeric code for CBOR encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            EntityType::Device => 1,
            EntityType::Asset => 2,
            EntityType::EntityView => 3,
            EntityType::Dashboard => 4,
            EntityType::Alarm => 5,
            EntityType::Customer => 6,
            EntityType::RuleChain => 7,
            EntityType::WidgetsBundle => 8,
            EntityType::Edge => 9,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EntityType::Device),
            2 => Some(EntityType::Asset),
            3 => Some(EntityType::EntityView),
            4 => Some(EntityType::Dashboard),
            5 => Some(EntityType::Alarm),
            6 => Some(EntityType::Customer),
            7 => Some(EntityType::RuleChain),
            8 => Some(EntityType::WidgetsBundle),
            9 => Some(EntityType::Edge),
            _ => None,
        }
    }

    /// Upper-case name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Device => "DEVICE",
            EntityType::Asset => "ASSET",
            EntityType::EntityView => "ENTITY_VIEW",
            EntityType::Dashboard => "DASHBOARD",
            EntityType::Alarm => "ALARM",
            EntityType::Customer => "CUSTOMER",
            EntityType::RuleChain => "RULE_CHAIN",
            EntityType::WidgetsBundle => "WIDGETS_BUNDLE",
            EntityType::Edge => "EDGE",
        }
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeEventAction {
    /// Entity created or first made visible to the edge.
    Added,
    /// Entity updated.
    Updated,
    /// Entity deleted.
    Deleted,
    /// Alarm acknowledged.
    AlarmAck,
    /// Alarm cleared.
    AlarmClear,
    /// Device credentials changed.
    CredentialsUpdated,
    /// Entity assigned to the edge.
    AssignedToEdge,
    /// Entity unassigned from the edge.
    UnassignedFromEdge,
}

impl EdgeEventAction {
    /// Converts to a numeric code for CBOR encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            EdgeEventAction::Added => 1,
            EdgeEventAction::Updated => 2,
            EdgeEventAction::Deleted => 3,
            EdgeEventAction::AlarmAck => 4,
            EdgeEventAction::AlarmClear => 5,
            EdgeEventAction::CredentialsUpdated => 6,
            EdgeEventAction::AssignedToEdge => 7,
            EdgeEventAction::UnassignedFromEdge => 8,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EdgeEventAction::Added),
            2 => Some(EdgeEventAction::Updated),
            3 => Some(EdgeEventAction::Deleted),
            4 => Some(EdgeEventAction::AlarmAck),
            5 => Some(EdgeEventAction::AlarmClear),
            6 => Some(EdgeEventAction::CredentialsUpdated),
            7 => Some(EdgeEventAction::AssignedToEdge),
            8 => Some(EdgeEventAction::UnassignedFromEdge),
            _ => None,
        }
    }

    /// Upper-case name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeEventAction::Added => "ADDED",
            EdgeEventAction::Updated => "UPDATED",
            EdgeEventAction::Deleted => "DELETED",
            EdgeEventAction::AlarmAck => "ALARM_ACK",
            EdgeEventAction::AlarmClear => "ALARM_CLEAR",
            EdgeEventAction::CredentialsUpdated => "CREDENTIALS_UPDATED",
            EdgeEventAction::AssignedToEdge => "ASSIGNED_TO_EDGE",
            EdgeEventAction::UnassignedFromEdge => "UNASSIGNED_FROM_EDGE",
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single queued change for one edge.
///
/// `seq` is zero until the outbox assigns it on append. `uid` is generated
/// at creation and survives persistence, so the receiving side can
/// recognise a redelivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Per-edge sequence id, assigned by the outbox.
    pub seq: u64,
    /// Stable identifier of this event.
    pub uid: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Target edge.
    pub edge_id: EdgeId,
    /// Entity the change refers to.
    pub entity_id: EntityId,
    /// Type of that entity.
    pub entity_type: EntityType,
    /// What happened.
    pub action: EdgeEventAction,
    /// Creation time in milliseconds since the epoch.
    pub created_at: u64,
    /// Type-specific payload.
    pub body: Option<Vec<u8>>,
}

impl EdgeEvent {
    /// Creates an unsequenced event.
    pub fn new(
        tenant_id: TenantId,
        edge_id: EdgeId,
        entity_type: EntityType,
        action: EdgeEventAction,
        entity_id: EntityId,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            seq: 0,
            uid: Uuid::new_v4(),
            tenant_id,
            edge_id,
            entity_id,
            entity_type,
            action,
            created_at: current_time_millis(),
            body,
        }
    }

    /// Creates an ADDED event, as produced by bulk sync.
    pub fn added(
        tenant_id: TenantId,
        edge_id: EdgeId,
        entity_type: EntityType,
        entity_id: EntityId,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self::new(
            tenant_id,
            edge_id,
            entity_type,
            EdgeEventAction::Added,
            entity_id,
            body,
        )
    }

    /// Returns a copy with the given sequence id.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let value = MapBuilder::new()
            .uint("seq", self.seq)
            .uuid("uid", self.uid)
            .uuid("tenant_id", self.tenant_id.as_uuid())
            .uuid("edge_id", self.edge_id.as_uuid())
            .uuid("entity_id", self.entity_id.as_uuid())
            .code("entity_type", self.entity_type.to_code())
            .code("action", self.action.to_code())
            .uint("created_at", self.created_at)
            .opt_bytes("body", self.body.as_deref())
            .build();
        encode_value(&value)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = decode_value(bytes)?;
        let fields = Fields::of(&value, "EdgeEvent")?;

        Ok(Self {
            seq: fields.uint("seq")?,
            uid: fields.uuid("uid")?,
            tenant_id: TenantId::from_uuid(fields.uuid("tenant_id")?),
            edge_id: EdgeId::from_uuid(fields.uuid("edge_id")?),
            entity_id: EntityId::from_uuid(fields.uuid("entity_id")?),
            entity_type: fields.code("entity_type", EntityType::from_code)?,
            action: fields.code("action", EdgeEventAction::from_code)?,
            created_at: fields.uint("created_at")?,
            body: fields.opt_bytes("body")?.map(<[u8]>::to_vec),
        })
    }
}
