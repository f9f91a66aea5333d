//! Cluster ownership of edges.
//!
//! Keys (tenant, or tenant plus edge) hash into a fixed number of virtual
//! partitions. Each partition is owned by the member with the highest
//! rendezvous score, so every node holding the same topology reaches the
//! same answer without coordination.

use crate::config::{OwnershipGranularity, RouterConfig};
use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{EdgeId, TenantId};
use parking_lot::RwLock;
use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Deterministic 64-bit FNV-1a hash.
pub fn hash_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Identifier of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster membership at one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Monotonic version of this membership.
    pub epoch: u64,
    /// Members, kept sorted and deduplicated.
    members: Vec<NodeId>,
}

impl ClusterTopology {
    /// Creates a topology.
    pub fn new(epoch: u64, members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members: Vec<NodeId> = members.into_iter().collect();
        members.sort();
        members.dedup();
        Self { epoch, members }
    }

    /// A topology with only `node`.
    pub fn single(node: NodeId) -> Self {
        Self::new(1, [node])
    }

    /// Members in sorted order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    fn owner_of(&self, partition: u32) -> Option<&NodeId> {
        self.members.iter().max_by_key(|member| {
            let mut key = member.as_str().as_bytes().to_vec();
            key.extend_from_slice(&partition.to_le_bytes());
            hash_key(key)
        })
    }
}

/// Answer to an ownership query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    /// Whether the local node owns the key.
    pub owned: bool,
    /// Epoch the answer was computed at.
    pub epoch: u64,
    /// Virtual partition of the key.
    pub partition: u32,
    /// Owning member, if the cluster is not empty.
    pub owner: Option<NodeId>,
}

/// Decides which node drives a given edge.
///
/// Lookups are pure reads of the installed topology. Topology changes are
/// installed out of band with [`update_topology`](Self::update_topology);
/// running tasks notice them on their next ownership check.
pub struct PartitionRouter {
    local: NodeId,
    config: RouterConfig,
    topology: RwLock<ClusterTopology>,
    epoch_tx: watch::Sender<u64>,
}

impl PartitionRouter {
    /// Creates a router for the local node.
    pub fn new(local: NodeId, config: RouterConfig, topology: ClusterTopology) -> Self {
        let (epoch_tx, _) = watch::channel(topology.epoch);
        Self {
            local,
            config,
            topology: RwLock::new(topology),
            epoch_tx,
        }
    }

    /// A router for a single-node deployment that owns everything.
    pub fn standalone(local: NodeId) -> Self {
        let topology = ClusterTopology::single(local.clone());
        Self::new(local, RouterConfig::default(), topology)
    }

    /// The local node id.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Current topology epoch.
    pub fn epoch(&self) -> u64 {
        self.topology.read().epoch
    }

    /// Virtual partition for a tenant and edge.
    pub fn partition_for(&self, tenant: TenantId, edge: EdgeId) -> u32 {
        let mut key = tenant.as_bytes().to_vec();
        if self.config.granularity == OwnershipGranularity::Edge {
            key.extend_from_slice(edge.as_bytes());
        }
        (hash_key(key) % u64::from(self.config.partitions)) as u32
    }

    /// Full ownership answer for a tenant and edge.
    pub fn query(&self, tenant: TenantId, edge: EdgeId) -> Ownership {
        let partition = self.partition_for(tenant, edge);
        let topology = self.topology.read();
        let owner = topology.owner_of(partition).cloned();
        Ownership {
            owned: owner.as_ref() == Some(&self.local),
            epoch: topology.epoch,
            partition,
            owner,
        }
    }

    /// True if the local node drives this edge.
    pub fn owns(&self, tenant: TenantId, edge: EdgeId) -> bool {
        self.query(tenant, edge).owned
    }

    /// True if the local node owns the system-wide scope.
    pub fn owns_system_scope(&self) -> bool {
        let partition =
            (hash_key(TenantId::SYS.as_bytes()) % u64::from(self.config.partitions)) as u32;
        self.topology.read().owner_of(partition) == Some(&self.local)
    }

    /// Installs a new topology.
    ///
    /// Re-installing the current topology is a no-op.
    ///
    /// # Errors
    ///
    /// `StaleTopology` if the epoch is older than the installed one, or equal
    /// with different members.
    pub fn update_topology(&self, topology: ClusterTopology) -> SyncResult<()> {
        let mut current = self.topology.write();
        if topology.epoch < current.epoch
            || (topology.epoch == current.epoch && topology != *current)
        {
            return Err(SyncError::StaleTopology {
                current: current.epoch,
                offered: topology.epoch,
            });
        }
        if topology == *current {
            return Ok(());
        }

        info!(
            epoch = topology.epoch,
            members = topology.members.len(),
            "installed cluster topology"
        );
        let epoch = topology.epoch;
        *current = topology;
        drop(current);
        self.epoch_tx.send_replace(epoch);
        Ok(())
    }

    /// Receiver that changes whenever a new topology is installed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}
