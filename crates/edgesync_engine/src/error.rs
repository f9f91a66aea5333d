//! Error types for the sync engine.

use edgesync_outbox::OutboxError;
use edgesync_protocol::{EdgeId, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The edge rejected a batch.
    #[error("batch {batch_id} rejected: {reason}")]
    Nack {
        /// Rejected batch.
        batch_id: u64,
        /// Reason given by the edge.
        reason: String,
    },

    /// Malformed or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Outbox or cursor failure.
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Upstream entity store failure during a bulk fetch.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Operation cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("edge is not connected")]
    NotConnected,

    /// The edge is not provisioned.
    #[error("unknown edge {0}")]
    UnknownEdge(EdgeId),

    /// A topology older than the current one was offered.
    #[error("stale topology epoch {offered} (current {current})")]
    StaleTopology {
        /// Epoch currently installed.
        current: u64,
        /// Epoch that was offered.
        offered: u64,
    },

    /// A one-shot operation was run twice.
    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    /// A startup step failed.
    #[error("startup step `{step}` failed: {message}")]
    Startup {
        /// Step name.
        step: String,
        /// Failure.
        message: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::Nack { .. } | SyncError::Fetch(_) => true,
            SyncError::Outbox(e) => e.is_transient(),
            _ => false,
        }
    }
}
