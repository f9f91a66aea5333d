//! # EdgeSync Server
//!
//! Uplink side of edge synchronization.
//!
//! This crate provides:
//! - [`UplinkHandler`], which applies edge-originated batches to platform state
//! - [`UplinkSession`], which decodes frames of one connected edge and answers them
//! - [`PlatformStore`], the seam to platform entities and alarms
//!
//! # Apply rules
//!
//! | Message | Effect | Repeated |
//! |---|---|---|
//! | `ENTITY_CREATED` / `ENTITY_UPDATED` | upsert by name, type and tenant | unchanged |
//! | `ALARM_ACK` | acknowledge | no-op if already acknowledged |
//! | `ALARM_CLEAR` | clear and acknowledge | no-op if already cleared |
//! | `ENTITY_DELETED` | remove | no-op if absent |
//!
//! Message ids of applied items are recorded per edge in the platform
//! store, so a batch that is delivered twice produces no second
//! notification, even when the platform restarted in between.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod dedup;
mod error;
mod handler;
mod session;
mod store;

pub use config::ServerConfig;
pub use dedup::DedupWindow;
pub use error::{ServerError, ServerResult};
pub use handler::UplinkHandler;
pub use session::{SessionEnd, SessionReply, UplinkSession};
pub use store::{
    AlarmRecord, EntityRecord, MemoryPlatformStore, Notification, PlatformStore,
    DEFAULT_APPLIED_CAPACITY,
};
