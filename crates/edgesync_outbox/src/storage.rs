//! Storage layout: where logs and cursors live.

use crate::backend::LogBackend;
use crate::cursor::Direction;
use crate::error::StorageResult;
use crate::memory::MemoryBackend;
use edgesync_protocol::EdgeId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Provides one log per edge plus persisted cursor positions.
pub trait OutboxStorage: Send + Sync {
    /// Opens (creating if needed) the log for an edge.
    fn open_log(&self, edge: EdgeId) -> StorageResult<Box<dyn LogBackend>>;

    /// Loads a persisted cursor, `None` if never stored.
    fn load_cursor(&self, edge: EdgeId, direction: Direction) -> StorageResult<Option<u64>>;

    /// Persists a cursor atomically.
    fn store_cursor(&self, edge: EdgeId, direction: Direction, position: u64) -> StorageResult<()>;

    /// Lists edges that have a log.
    fn list_edges(&self) -> StorageResult<Vec<EdgeId>>;

    /// Removes an edge's log and cursors.
    fn remove_edge(&self, edge: EdgeId) -> StorageResult<()>;
}

/// Storage kept entirely in memory.
///
/// Logs handed out for the same edge share bytes, so dropping an
/// `EventOutbox` and opening a new one over the same storage behaves like
/// a process restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    logs: RwLock<HashMap<EdgeId, MemoryBackend>>,
    cursors: RwLock<HashMap<(EdgeId, Direction), u64>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to an edge's log bytes, creating it if needed.
    pub fn backend(&self, edge: EdgeId) -> MemoryBackend {
        self.logs.write().entry(edge).or_default().clone()
    }
}

impl OutboxStorage for MemoryStorage {
    fn open_log(&self, edge: EdgeId) -> StorageResult<Box<dyn LogBackend>> {
        Ok(Box::new(self.backend(edge)))
    }

    fn load_cursor(&self, edge: EdgeId, direction: Direction) -> StorageResult<Option<u64>> {
        Ok(self.cursors.read().get(&(edge, direction)).copied())
    }

    fn store_cursor(&self, edge: EdgeId, direction: Direction, position: u64) -> StorageResult<()> {
        self.cursors.write().insert((edge, direction), position);
        Ok(())
    }

    fn list_edges(&self) -> StorageResult<Vec<EdgeId>> {
        let mut edges: Vec<EdgeId> = self.logs.read().keys().copied().collect();
        edges.sort();
        Ok(edges)
    }

    fn remove_edge(&self, edge: EdgeId) -> StorageResult<()> {
        self.logs.write().remove(&edge);
        self.cursors.write().retain(|(e, _), _| *e != edge);
        Ok(())
    }
}
