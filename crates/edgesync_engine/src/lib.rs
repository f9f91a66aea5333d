//! # Edgesync Engine
//!
//! Platform-side machinery that moves queued edge events to their edges.
//!
//! This crate provides:
//! - Partition routing: which cluster node drives which edge
//! - Generic paginated bulk fetch into the outbox
//! - Incremental change capture, including the alarm lifecycle
//! - The per-edge downlink sender and its supervisor
//! - Ordered startup and the periodic resource sync job
//!
//! ## Delivery model
//!
//! Every owned, connected edge gets one sender task. The sender reads a
//! bounded batch after the downlink cursor, ships it, and advances the
//! cursor only when the edge acknowledges that exact batch:
//!
//! ```text
//! IDLE -> SENDING -> AWAITING_ACK -> (ack)          -> IDLE
//!                                 -> (nack/timeout) -> BACKOFF -> SENDING
//! ```
//!
//! ## Key Invariants
//!
//! - At most one node drives an edge at a time
//! - One batch in flight per edge
//! - The cursor is the last acknowledged sequence id, never more
//! - Redelivery after a crash is expected; receivers dedup by message id

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capture;
mod channel;
mod config;
mod edge;
mod error;
mod fetcher;
mod resource_sync;
mod router;
mod sender;
mod startup;
mod supervisor;

pub use capture::{CaptureReport, ChangeCapture, RelatedEdges, StaticAssignments, TrackedAlarm};
pub use channel::{EdgeChannel, FrameTransport, FramedChannel, MockChannel, MockReply};
pub use config::{
    DownlinkConfig, FetchConfig, OwnershipGranularity, ResourceSyncConfig, RetryConfig,
    RouterConfig,
};
pub use edge::{Connectivity, Edge, EdgeRegistry};
pub use error::{SyncError, SyncResult};
pub use fetcher::{
    BulkFetch, ConvertFn, ConvertedEntity, DrainReport, FetchDrain, FetchProgress,
    FetcherRegistry, PageEvents, PageFetch, PageableFetcher, SkippedEntity, VecPageSource,
};
pub use resource_sync::{
    spawn_periodic, FileType, GatewayDashboardSync, ImportOutcome, RepoFile, ResourceKind,
    ResourceRepository, ResourceSink, GATEWAYS_DASHBOARD_KEY, GATEWAYS_REPO_KEY,
};
pub use router::{hash_key, ClusterTopology, NodeId, Ownership, PartitionRouter};
pub use sender::{DeliveryOutcome, DeliveryState, DeliveryStatus, DownlinkSender, StopReason};
pub use startup::{StartupPlan, StartupStage};
pub use supervisor::{EdgeStatus, EdgeSupervisor, ReconcileReport};
