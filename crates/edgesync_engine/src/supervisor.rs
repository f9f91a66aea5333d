//! Supervision of per-edge downlink senders.

use crate::channel::EdgeChannel;
use crate::config::DownlinkConfig;
use crate::edge::{Connectivity, Edge, EdgeRegistry};
use crate::error::{SyncError, SyncResult};
use crate::router::PartitionRouter;
use crate::sender::{DeliveryStatus, DownlinkSender, StopReason};
use edgesync_outbox::{EventOutbox, OutboxError};
use edgesync_protocol::EdgeId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct SenderTask {
    cancel: CancellationToken,
    handle: JoinHandle<SyncResult<StopReason>>,
}

/// Sender changes made by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Edges whose sender was started.
    pub started: Vec<EdgeId>,
    /// Edges whose sender was cancelled or found finished.
    pub stopped: Vec<EdgeId>,
}

/// Queryable state of one edge.
#[derive(Debug, Clone)]
pub struct EdgeStatus {
    /// The edge.
    pub edge: Edge,
    /// Whether a sender task is running.
    pub sending: bool,
    /// Last known delivery status.
    pub delivery: DeliveryStatus,
    /// Downlink cursor.
    pub cursor: u64,
    /// Events waiting for delivery.
    pub pending: usize,
}

/// Runs one downlink sender per connected edge owned by this node.
///
/// Callers report connects, disconnects and topology changes; each of them
/// triggers [`reconcile`](Self::reconcile), which brings the set of running
/// senders in line with the registry and the router.
pub struct EdgeSupervisor {
    router: Arc<PartitionRouter>,
    outbox: Arc<EventOutbox>,
    config: DownlinkConfig,
    registry: EdgeRegistry,
    channels: RwLock<HashMap<EdgeId, Arc<dyn EdgeChannel>>>,
    statuses: RwLock<HashMap<EdgeId, Arc<RwLock<DeliveryStatus>>>>,
    tasks: Mutex<HashMap<EdgeId, SenderTask>>,
    cancel: CancellationToken,
}

impl EdgeSupervisor {
    /// Creates a supervisor with an empty registry.
    pub fn new(
        router: Arc<PartitionRouter>,
        outbox: Arc<EventOutbox>,
        config: DownlinkConfig,
    ) -> Self {
        Self {
            router,
            outbox,
            config,
            registry: EdgeRegistry::new(),
            channels: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// The edge registry.
    pub fn registry(&self) -> &EdgeRegistry {
        &self.registry
    }

    /// Adds or replaces an edge.
    pub fn provision(&self, edge: Edge) {
        info!(edge_id = %edge.id, tenant_id = %edge.tenant, "edge provisioned");
        self.registry.provision(edge);
    }

    /// Records a new channel for an edge and starts its sender if owned.
    pub fn connect(
        &self,
        edge: EdgeId,
        channel: Arc<dyn EdgeChannel>,
    ) -> SyncResult<ReconcileReport> {
        self.registry.set_connectivity(edge, Connectivity::Connected)?;
        if let Some(old) = self.channels.write().insert(edge, channel) {
            old.close();
        }
        self.stop(edge);
        info!(edge_id = %edge, "edge connected");
        Ok(self.reconcile())
    }

    /// Closes an edge's channel and stops its sender.
    pub fn disconnect(&self, edge: EdgeId) -> SyncResult<ReconcileReport> {
        self.registry
            .set_connectivity(edge, Connectivity::Disconnected)?;
        if let Some(channel) = self.channels.write().remove(&edge) {
            channel.close();
        }
        info!(edge_id = %edge, "edge disconnected");
        Ok(self.reconcile())
    }

    /// Removes an edge and its outbox.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if events are still undelivered and
    /// `discard_pending` is false.
    pub fn remove(&self, edge: EdgeId, discard_pending: bool) -> SyncResult<()> {
        if self.registry.get(edge).is_none() {
            return Err(SyncError::UnknownEdge(edge));
        }
        let pending = self.outbox.pending_count(edge)?;
        if pending > 0 && !discard_pending {
            return Err(OutboxError::EdgeHasPendingEvents { edge, pending }.into());
        }
        self.stop(edge);
        if let Some(channel) = self.channels.write().remove(&edge) {
            channel.close();
        }
        self.outbox.delete_edge(edge, discard_pending)?;
        self.statuses.write().remove(&edge);
        self.registry.remove(edge);
        info!(edge_id = %edge, discarded = pending, "edge removed");
        Ok(())
    }

    fn wants_sender(&self, edge: &Edge) -> bool {
        edge.is_connected()
            && self.router.owns(edge.tenant, edge.id)
            && self
                .channels
                .read()
                .get(&edge.id)
                .is_some_and(|c| c.is_connected())
    }

    fn stop(&self, edge: EdgeId) -> bool {
        match self.tasks.lock().remove(&edge) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Starts and stops senders to match connectivity and ownership.
    ///
    /// Must be called from within a tokio runtime.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.cancel.is_cancelled() {
            return report;
        }

        let mut tasks = self.tasks.lock();
        for edge in self.registry.list() {
            let wanted = self.wants_sender(&edge);
            let finished = tasks.get(&edge.id).is_some_and(|t| t.handle.is_finished());

            if finished || (!wanted && tasks.contains_key(&edge.id)) {
                if let Some(task) = tasks.remove(&edge.id) {
                    task.cancel.cancel();
                    report.stopped.push(edge.id);
                }
            }
            if wanted && !tasks.contains_key(&edge.id) {
                let Some(channel) = self.channels.read().get(&edge.id).cloned() else {
                    continue;
                };
                tasks.insert(edge.id, self.spawn_sender(&edge, channel));
                report.started.push(edge.id);
            }
        }

        // Senders for edges that were removed from the registry.
        let known: Vec<EdgeId> = tasks.keys().copied().collect();
        for id in known {
            if self.registry.get(id).is_none() {
                if let Some(task) = tasks.remove(&id) {
                    task.cancel.cancel();
                    report.stopped.push(id);
                }
            }
        }

        if !report.started.is_empty() || !report.stopped.is_empty() {
            debug!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                epoch = self.router.epoch(),
                "reconciled edge senders"
            );
        }
        report
    }

    fn spawn_sender(&self, edge: &Edge, channel: Arc<dyn EdgeChannel>) -> SenderTask {
        let sender = DownlinkSender::new(
            edge.tenant,
            edge.id,
            self.outbox.clone(),
            channel,
            self.router.clone(),
            self.config.clone(),
        );
        self.statuses
            .write()
            .insert(edge.id, sender.status_handle());

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let edge_id = edge.id;
            async move {
                let result = sender.run(cancel).await;
                if let Err(e) = &result {
                    error!(%edge_id, error = %e, "downlink sender failed");
                }
                result
            }
        });
        SenderTask { cancel, handle }
    }

    /// Whether a sender task is running for the edge.
    pub fn is_sending(&self, edge: EdgeId) -> bool {
        self.tasks
            .lock()
            .get(&edge)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Status of one edge.
    pub fn status(&self, edge: EdgeId) -> SyncResult<EdgeStatus> {
        let record = self.registry.get(edge).ok_or(SyncError::UnknownEdge(edge))?;
        let delivery = self
            .statuses
            .read()
            .get(&edge)
            .map(|s| s.read().clone())
            .unwrap_or_default();
        let stats = self.outbox.stats(edge)?;
        Ok(EdgeStatus {
            edge: record,
            sending: self.is_sending(edge),
            delivery,
            cursor: stats.cursor,
            pending: stats.pending,
        })
    }

    /// Reconciles on every topology change until shut down.
    pub fn watch_topology(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut epochs = self.router.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor.cancel.cancelled() => break,
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let epoch = *epochs.borrow_and_update();
                        let report = supervisor.reconcile();
                        info!(
                            epoch,
                            started = report.started.len(),
                            stopped = report.stopped.len(),
                            "topology change handled"
                        );
                    }
                }
            }
        })
    }

    /// Cancels every sender and waits for them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<(EdgeId, SenderTask)> = self.tasks.lock().drain().collect();
        for (edge_id, task) in tasks {
            match task.handle.await {
                Ok(Ok(reason)) => debug!(%edge_id, ?reason, "sender joined"),
                Ok(Err(e)) => error!(%edge_id, error = %e, "sender ended with error"),
                Err(e) => error!(%edge_id, error = %e, "sender task panicked"),
            }
        }
        info!("edge supervisor stopped");
    }
}
