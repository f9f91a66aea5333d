//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod inspect;

use clap::ValueEnum;
use edgesync_outbox::{DirStorage, EventOutbox, OutboxError, StorageError};
use edgesync_protocol::EdgeId;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the CLI.
#[derive(Error, Debug)]
pub enum CliError {
    /// Outbox directory could not be opened.
    #[error("cannot open outbox: {0}")]
    Storage(#[from] StorageError),

    /// Outbox operation failed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// The directory has no log for this edge.
    #[error("no outbox for edge {0}")]
    UnknownEdge(EdgeId),

    /// JSON output failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing outbox directory.
pub fn open_outbox(path: &Path) -> CliResult<EventOutbox> {
    let storage = DirStorage::open(path, false)?;
    Ok(EventOutbox::open(Arc::new(storage))?)
}

/// Fails unless the outbox holds a log for `edge`.
pub fn require_edge(outbox: &EventOutbox, edge: EdgeId) -> CliResult<()> {
    if outbox.edges()?.contains(&edge) {
        Ok(())
    } else {
        Err(CliError::UnknownEdge(edge))
    }
}
