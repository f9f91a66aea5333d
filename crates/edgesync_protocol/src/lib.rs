//! # EdgeSync Protocol
//!
//! Edge event and wire message types with their CBOR codecs.
//!
//! This crate provides:
//! - `EdgeEvent`, the queued unit of change for one edge
//! - `PageLink` / `PageData` for bulk reads from entity stores
//! - Wire messages (`DownlinkBatch`, `UplinkBatch`, `BatchAck`)
//! - The compaction policy applied to undelivered events
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod alarm;
mod codec;
mod compaction;
mod error;
mod event;
mod ids;
mod messages;
mod page;

pub use alarm::{AlarmSeverity, AlarmStatus};
pub use compaction::{compact_pending, Compacted};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{current_time_millis, EdgeEvent, EdgeEventAction, EntityType};
pub use ids::{EdgeId, EntityId, TenantId};
pub use messages::{
    AlarmPayload, BatchAck, DownlinkBatch, EntityPayload, ItemOutcome, ItemStatus,
    OriginatorRef, ProtocolErrorFrame, SubMessage, SyncMessage, UplinkBatch, UpdateMsgType,
    UpdatePayload,
};
pub use page::{PageData, PageLink, SortDirection, SortOrder};

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
