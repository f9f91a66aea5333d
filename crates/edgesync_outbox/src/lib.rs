//! # EdgeSync Outbox
//!
//! Durable, per-edge ordered queue of edge events plus the cursors that
//! record delivery progress.
//!
//! ## Layers
//!
//! - [`LogBackend`]: opaque append-only byte log ([`MemoryBackend`],
//!   [`FileBackend`])
//! - [`OutboxStorage`]: one log per edge plus cursor files
//!   ([`MemoryStorage`], [`DirStorage`])
//! - [`EventOutbox`]: record framing, sequence assignment, recovery and
//!   retention on top of a storage
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use edgesync_outbox::{EventOutbox, MemoryStorage};
//! use edgesync_protocol::{EdgeEvent, EdgeId, EntityId, EntityType, TenantId};
//!
//! let outbox = EventOutbox::open(Arc::new(MemoryStorage::new())).unwrap();
//! let edge = EdgeId::new();
//! let event = EdgeEvent::added(TenantId::new(), edge, EntityType::Device, EntityId::new(), None);
//!
//! let receipt = outbox.append(edge, vec![event]).unwrap();
//! assert_eq!(receipt.first_seq, 1);
//! assert_eq!(outbox.read_pending(edge, 10).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cursor;
mod dir;
mod error;
mod file;
mod memory;
mod outbox;
mod record;
mod storage;

pub use backend::LogBackend;
pub use cursor::{CursorStore, Direction};
pub use dir::DirStorage;
pub use error::{OutboxError, OutboxResult, StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use outbox::{AppendReceipt, CompactionReport, EdgeStats, EventOutbox};
pub use record::{compute_crc32, RecordKind, RECORD_MAGIC, RECORD_VERSION};
pub use storage::{MemoryStorage, OutboxStorage};
