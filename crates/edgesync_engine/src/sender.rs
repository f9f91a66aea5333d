//! Per-edge downlink delivery.
//!
//! A [`DownlinkSender`] drains one edge's outbox in bounded batches, one
//! batch in flight at a time, and moves the downlink cursor only when the
//! edge acknowledges exactly the batch it was sent. A crash or cancellation
//! anywhere before that point leaves the cursor on the last acknowledged
//! batch, so the next sender resends from there.

use crate::channel::EdgeChannel;
use crate::config::DownlinkConfig;
use crate::error::{SyncError, SyncResult};
use crate::router::PartitionRouter;
use edgesync_outbox::{Direction, EventOutbox};
use edgesync_protocol::{DownlinkBatch, EdgeId, TenantId};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivery state of one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryState {
    /// Nothing to send, waiting for appends.
    #[default]
    Idle,
    /// Reading and encoding a batch.
    Sending,
    /// A batch is in flight.
    AwaitingAck,
    /// Waiting before the next attempt.
    Backoff,
}

impl DeliveryState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Idle => "idle",
            DeliveryState::Sending => "sending",
            DeliveryState::AwaitingAck => "awaiting_ack",
            DeliveryState::Backoff => "backoff",
        }
    }
}

/// Observable delivery status of one edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStatus {
    /// Current state.
    pub state: DeliveryState,
    /// Failed attempts since the last acknowledged batch.
    pub consecutive_failures: u32,
    /// Set once `consecutive_failures` reaches the configured threshold.
    pub degraded: bool,
    /// Batches acknowledged since the sender started.
    pub batches_delivered: u64,
    /// Attempts that found nothing pending.
    pub idle_polls: u64,
    /// Last failure.
    pub last_error: Option<String>,
}

/// Why a sender's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Cancelled by the owner of the task.
    Cancelled,
    /// Another node now owns the edge.
    OwnershipLost,
    /// The channel to the edge is gone.
    Disconnected,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The outbox had nothing pending.
    Idle,
    /// A batch was acknowledged and the cursor moved.
    Delivered {
        /// Batch identifier.
        batch_id: u64,
        /// New cursor position.
        last_seq: u64,
        /// Events in the batch.
        count: usize,
    },
}

/// Drains one edge's outbox over a channel.
pub struct DownlinkSender {
    tenant: TenantId,
    edge: EdgeId,
    outbox: Arc<EventOutbox>,
    channel: Arc<dyn EdgeChannel>,
    router: Arc<PartitionRouter>,
    config: DownlinkConfig,
    status: Arc<RwLock<DeliveryStatus>>,
}

impl DownlinkSender {
    /// Creates a sender for one edge.
    pub fn new(
        tenant: TenantId,
        edge: EdgeId,
        outbox: Arc<EventOutbox>,
        channel: Arc<dyn EdgeChannel>,
        router: Arc<PartitionRouter>,
        config: DownlinkConfig,
    ) -> Self {
        Self {
            tenant,
            edge,
            outbox,
            channel,
            router,
            config,
            status: Arc::new(RwLock::new(DeliveryStatus::default())),
        }
    }

    /// The edge this sender drives.
    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    /// Snapshot of the delivery status.
    pub fn status(&self) -> DeliveryStatus {
        self.status.read().clone()
    }

    /// Shared handle to the status, readable after the sender is gone.
    pub fn status_handle(&self) -> Arc<RwLock<DeliveryStatus>> {
        self.status.clone()
    }

    /// Current downlink cursor.
    pub fn cursor(&self) -> SyncResult<u64> {
        Ok(self.outbox.cursors().get(self.edge, Direction::Downlink)?)
    }

    fn set_state(&self, state: DeliveryState) {
        self.status.write().state = state;
    }

    /// Sends the next pending batch and waits for its acknowledgment.
    ///
    /// The cursor moves only if the edge accepts the batch and reports its
    /// final sequence id. Any other answer leaves it untouched.
    ///
    /// The batch id is the sequence id of the batch's first event. It only
    /// grows across batches and sender restarts, and a resend of an
    /// unacknowledged batch keeps its id.
    pub async fn deliver_once(&self) -> SyncResult<DeliveryOutcome> {
        self.set_state(DeliveryState::Sending);
        let events = self.outbox.read_pending(self.edge, self.config.batch_size)?;
        let Some(first) = events.first() else {
            let mut status = self.status.write();
            status.state = DeliveryState::Idle;
            status.idle_polls += 1;
            return Ok(DeliveryOutcome::Idle);
        };

        let batch_id = first.seq;
        let batch = DownlinkBatch::from_events(batch_id, self.edge, &events)?;

        self.set_state(DeliveryState::AwaitingAck);
        debug!(
            edge_id = %self.edge,
            batch_id,
            first_seq = batch.first_seq,
            last_seq = batch.last_seq,
            "sending downlink batch"
        );
        let ack = tokio::time::timeout(self.config.ack_timeout, self.channel.deliver(&batch))
            .await
            .map_err(|_| SyncError::Timeout)??;

        if ack.batch_id != batch_id {
            return Err(SyncError::Protocol(format!(
                "ack for batch {} while awaiting {batch_id}",
                ack.batch_id
            )));
        }
        if !ack.accepted {
            return Err(SyncError::Nack {
                batch_id,
                reason: ack.error.unwrap_or_default(),
            });
        }
        if ack.last_seq != Some(batch.last_seq) {
            return Err(SyncError::Protocol(format!(
                "ack covers {:?}, batch {batch_id} ends at {}",
                ack.last_seq, batch.last_seq
            )));
        }

        self.outbox.acknowledge(self.edge, batch.last_seq)?;
        {
            let mut status = self.status.write();
            if status.degraded {
                info!(edge_id = %self.edge, "edge delivery recovered");
            }
            status.state = DeliveryState::Idle;
            status.consecutive_failures = 0;
            status.degraded = false;
            status.batches_delivered += 1;
            status.last_error = None;
        }
        debug!(
            edge_id = %self.edge,
            batch_id,
            last_seq = batch.last_seq,
            "downlink batch acknowledged"
        );

        Ok(DeliveryOutcome::Delivered {
            batch_id,
            last_seq: batch.last_seq,
            count: events.len(),
        })
    }

    fn record_failure(&self, error: &SyncError) -> u32 {
        let mut status = self.status.write();
        status.state = DeliveryState::Backoff;
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.last_error = Some(error.to_string());
        if !status.degraded && status.consecutive_failures >= self.config.degraded_threshold() {
            status.degraded = true;
            warn!(
                edge_id = %self.edge,
                failures = status.consecutive_failures,
                error = %error,
                "edge delivery degraded"
            );
        }
        status.consecutive_failures
    }

    /// Delivers until cancelled, disconnected or no longer the owner.
    ///
    /// Ownership and connectivity are re-checked before every batch. While
    /// idle the loop sleeps until an append, a topology change or the poll
    /// interval.
    ///
    /// # Errors
    ///
    /// Only if the edge's log or cursor cannot be read. Delivery failures are
    /// retried with backoff indefinitely.
    pub async fn run(&self, cancel: CancellationToken) -> SyncResult<StopReason> {
        let appended = self.outbox.subscribe(self.edge)?;
        let mut topology = self.router.subscribe();
        let cursor = self.cursor()?;
        info!(edge_id = %self.edge, cursor, "downlink sender started");

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if !self.router.owns(self.tenant, self.edge) {
                break StopReason::OwnershipLost;
            }
            if !self.channel.is_connected() {
                break StopReason::Disconnected;
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                attempt = self.deliver_once() => attempt,
            };

            match attempt {
                Ok(DeliveryOutcome::Delivered { .. }) => {}
                Ok(DeliveryOutcome::Idle) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break StopReason::Cancelled,
                        _ = appended.notified() => {}
                        Ok(()) = topology.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(SyncError::NotConnected) => break StopReason::Disconnected,
                Err(e) => {
                    let failures = self.record_failure(&e);
                    let delay = self.config.retry.delay_for_attempt(failures);
                    debug!(
                        edge_id = %self.edge,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "downlink attempt failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break StopReason::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.set_state(DeliveryState::Idle);
        info!(
            edge_id = %self.edge,
            ?reason,
            cursor = ?self.cursor().ok(),
            "downlink sender stopped"
        );
        Ok(reason)
    }
}
