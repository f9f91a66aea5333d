//! Error types for the uplink server.

use edgesync_protocol::{EdgeId, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while processing uplink traffic.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Batch rejected as a whole.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// This node does not drive the edge.
    #[error("edge {edge} is owned by another node")]
    NotOwner {
        /// Edge the batch came from.
        edge: EdgeId,
    },

    /// A session exceeded its protocol violation budget.
    #[error("edge {edge} exceeded {count} consecutive protocol violations")]
    TooManyViolations {
        /// Offending edge.
        edge: EdgeId,
        /// Violations counted.
        count: u32,
    },

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Platform store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl ServerError {
    /// Returns true if the edge sent something it should not have.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidBatch(_)
                | ServerError::TooManyViolations { .. }
                | ServerError::Codec(_)
        )
    }

    /// Returns true if the failure is on the platform side.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Store(_))
    }
}
