//! Error types for the outbox.

use edgesync_protocol::{EdgeId, ProtocolError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::cursor::Direction;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stored data cannot be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Offset of the record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Another process holds the directory lock.
    #[error("outbox directory is locked by another process: {}", .0.display())]
    Locked(PathBuf),

    /// The path is unusable as an outbox directory.
    #[error("invalid outbox path {}: {reason}", path.display())]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}

/// Errors raised by the outbox and cursor store.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Storage failure. An append that fails this way consumed no sequence ids.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An event could not be encoded or a stored event could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// An event addressed to another edge was appended.
    #[error("event for edge {found} appended to edge {expected}")]
    EdgeMismatch {
        /// Edge being appended to.
        expected: EdgeId,
        /// Edge the event targets.
        found: EdgeId,
    },

    /// A cursor was moved backwards.
    #[error("{direction} cursor for edge {edge} cannot move from {current} back to {requested}")]
    CursorRegression {
        /// Edge.
        edge: EdgeId,
        /// Cursor direction.
        direction: Direction,
        /// Current position.
        current: u64,
        /// Requested position.
        requested: u64,
    },

    /// A downlink cursor was moved past the last appended event.
    #[error("cursor for edge {edge} cannot move to {requested}, last sequence is {last}")]
    CursorBeyondLog {
        /// Edge.
        edge: EdgeId,
        /// Requested position.
        requested: u64,
        /// Last appended sequence id.
        last: u64,
    },

    /// The operation would drop events that were never delivered.
    #[error("edge {edge} still has {pending} undelivered events")]
    EdgeHasPendingEvents {
        /// Edge.
        edge: EdgeId,
        /// Number of undelivered events.
        pending: usize,
    },

    /// A failed append could not be rolled back, so the edge log no longer
    /// matches its on-disk state. Writes are refused until the outbox is
    /// reopened and the log recovered.
    #[error("edge {edge} log needs recovery after a failed rollback")]
    LogPoisoned {
        /// Edge.
        edge: EdgeId,
    },
}

impl OutboxError {
    /// True when retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, OutboxError::Storage(StorageError::Io(_)))
    }
}
