//! Delivery cursors.

use crate::error::{OutboxError, OutboxResult};
use crate::storage::OutboxStorage;
use edgesync_protocol::EdgeId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Direction a cursor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Platform to edge: last acknowledged outbox sequence id.
    Downlink,
    /// Edge to platform: last applied uplink batch id.
    Uplink,
}

impl Direction {
    /// Lower-case name, also used in cursor file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Downlink => "downlink",
            Direction::Uplink => "uplink",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic per (edge, direction) positions, persisted on every move.
///
/// A cursor that was never stored reads as 0. The new position becomes
/// visible only after it is durable.
pub struct CursorStore {
    storage: Arc<dyn OutboxStorage>,
    cache: RwLock<HashMap<(EdgeId, Direction), u64>>,
    write: Mutex<()>,
}

impl CursorStore {
    /// Creates a cursor store over the given storage.
    pub fn new(storage: Arc<dyn OutboxStorage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            write: Mutex::new(()),
        }
    }

    /// Current position.
    pub fn get(&self, edge: EdgeId, direction: Direction) -> OutboxResult<u64> {
        if let Some(&position) = self.cache.read().get(&(edge, direction)) {
            return Ok(position);
        }
        let position = self.storage.load_cursor(edge, direction)?.unwrap_or(0);
        self.cache.write().insert((edge, direction), position);
        Ok(position)
    }

    /// Moves a cursor forward.
    ///
    /// Returns `false` if the cursor is already at `position`.
    ///
    /// # Errors
    ///
    /// `CursorRegression` if `position` is behind the current value.
    pub fn advance(&self, edge: EdgeId, direction: Direction, position: u64) -> OutboxResult<bool> {
        let _guard = self.write.lock();
        let current = self.get(edge, direction)?;
        if position < current {
            return Err(OutboxError::CursorRegression {
                edge,
                direction,
                current,
                requested: position,
            });
        }
        if position == current {
            return Ok(false);
        }
        self.storage.store_cursor(edge, direction, position)?;
        self.cache.write().insert((edge, direction), position);
        Ok(true)
    }

    /// Drops cached positions of an edge.
    pub fn forget(&self, edge: EdgeId) {
        self.cache.write().retain(|(e, _), _| *e != edge);
    }
}
