//! Edge model and registry.

use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{current_time_millis, EdgeId, TenantId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Whether an edge currently has a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// A channel is open.
    Connected,
    /// No channel.
    #[default]
    Disconnected,
}

/// A provisioned edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Edge id.
    pub id: EdgeId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Display name.
    pub name: String,
    /// Key the edge authenticates and is addressed with.
    pub routing_key: String,
    /// Current connectivity.
    pub connectivity: Connectivity,
    /// Last connect time (ms).
    pub last_connected_at: Option<u64>,
    /// Last disconnect time (ms).
    pub last_disconnected_at: Option<u64>,
}

impl Edge {
    /// Creates a disconnected edge with a fresh id.
    pub fn new(tenant: TenantId, name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            id: EdgeId::new(),
            tenant,
            name: name.into(),
            routing_key: routing_key.into(),
            connectivity: Connectivity::Disconnected,
            last_connected_at: None,
            last_disconnected_at: None,
        }
    }

    /// Returns a copy with the given id.
    pub fn with_id(mut self, id: EdgeId) -> Self {
        self.id = id;
        self
    }

    /// Whether a channel is open.
    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }
}

/// Provisioned edges by id.
#[derive(Debug, Default)]
pub struct EdgeRegistry {
    edges: RwLock<HashMap<EdgeId, Edge>>,
}

impl EdgeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an edge, keeping the connectivity of a replaced one.
    pub fn provision(&self, mut edge: Edge) {
        let mut edges = self.edges.write();
        if let Some(existing) = edges.get(&edge.id) {
            edge.connectivity = existing.connectivity;
            edge.last_connected_at = existing.last_connected_at;
            edge.last_disconnected_at = existing.last_disconnected_at;
        }
        edges.insert(edge.id, edge);
    }

    /// Looks up an edge.
    pub fn get(&self, id: EdgeId) -> Option<Edge> {
        self.edges.read().get(&id).cloned()
    }

    /// Finds an edge by routing key.
    pub fn find_by_routing_key(&self, routing_key: &str) -> Option<Edge> {
        self.edges
            .read()
            .values()
            .find(|e| e.routing_key == routing_key)
            .cloned()
    }

    /// All edges sorted by id.
    pub fn list(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.read().values().cloned().collect();
        edges.sort_by_key(|e| e.id);
        edges
    }

    /// Records a connectivity change.
    pub fn set_connectivity(&self, id: EdgeId, connectivity: Connectivity) -> SyncResult<Edge> {
        let mut edges = self.edges.write();
        let edge = edges.get_mut(&id).ok_or(SyncError::UnknownEdge(id))?;
        if edge.connectivity != connectivity {
            edge.connectivity = connectivity;
            let now = Some(current_time_millis());
            match connectivity {
                Connectivity::Connected => edge.last_connected_at = now,
                Connectivity::Disconnected => edge.last_disconnected_at = now,
            }
        }
        Ok(edge.clone())
    }

    /// Removes an edge.
    pub fn remove(&self, id: EdgeId) -> Option<Edge> {
        self.edges.write().remove(&id)
    }
}
