//! Channel abstraction between a downlink sender and its edge.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use edgesync_protocol::{BatchAck, DownlinkBatch, SyncMessage};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// A long-lived channel to one edge.
///
/// Implementations deliver one batch at a time and return the edge's
/// acknowledgment for it.
#[async_trait]
pub trait EdgeChannel: Send + Sync {
    /// Sends a batch and waits for its acknowledgment.
    async fn deliver(&self, batch: &DownlinkBatch) -> SyncResult<BatchAck>;

    /// Whether the edge is currently reachable.
    fn is_connected(&self) -> bool;

    /// Closes the channel.
    fn close(&self);
}

/// Byte-level frame exchange, e.g. one request/response on an RPC stream.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Sends a frame and returns the reply frame.
    async fn exchange(&self, frame: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the transport is healthy.
    fn is_healthy(&self) -> bool;
}

/// [`EdgeChannel`] speaking the framed CBOR protocol over a [`FrameTransport`].
pub struct FramedChannel<T: FrameTransport> {
    transport: T,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<T: FrameTransport> FramedChannel<T> {
    /// Creates a channel over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the last transport error.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Marks the channel usable again after a reconnect.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: FrameTransport> EdgeChannel for FramedChannel<T> {
    async fn deliver(&self, batch: &DownlinkBatch) -> SyncResult<BatchAck> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let frame = SyncMessage::Downlink(batch.clone()).encode_frame()?;
        let reply = self.transport.exchange(frame).await.map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            self.connected.store(false, Ordering::SeqCst);
            SyncError::transport_retryable(e)
        })?;

        match SyncMessage::decode_frame(&reply)? {
            SyncMessage::Ack(ack) if ack.batch_id == batch.batch_id => Ok(ack),
            SyncMessage::Ack(ack) => {
                warn!(
                    edge_id = %batch.edge_id,
                    batch_id = batch.batch_id,
                    acked = ack.batch_id,
                    "ack for a different batch"
                );
                Err(SyncError::Protocol(format!(
                    "ack for batch {} while awaiting {}",
                    ack.batch_id, batch.batch_id
                )))
            }
            SyncMessage::Error(frame) => Err(SyncError::Nack {
                batch_id: batch.batch_id,
                reason: frame.reason,
            }),
            other => Err(SyncError::Protocol(format!(
                "unexpected frame type {} in reply to a downlink batch",
                other.type_code()
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.transport.is_healthy()
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Scripted reply of a [`MockChannel`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Acknowledge the whole batch.
    Ack,
    /// Acknowledge up to a different sequence id.
    AckUpTo(u64),
    /// Negative acknowledgment.
    Nack(String),
    /// Fail with a retryable transport error.
    Fail(String),
    /// Drop the connection.
    Disconnect,
    /// Never answer.
    Hang,
}

/// A mock channel for testing.
///
/// Replies are taken from a script in order; once the script is exhausted
/// every batch is acknowledged.
#[derive(Debug)]
pub struct MockChannel {
    connected: AtomicBool,
    script: Mutex<VecDeque<MockReply>>,
    delivered: Mutex<Vec<DownlinkBatch>>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    /// Creates a connected mock channel.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Queues a reply.
    pub fn push_reply(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Batches handed to the channel so far, including unacknowledged ones.
    pub fn delivered(&self) -> Vec<DownlinkBatch> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl EdgeChannel for MockChannel {
    async fn deliver(&self, batch: &DownlinkBatch) -> SyncResult<BatchAck> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.delivered.lock().push(batch.clone());

        let reply = self.script.lock().pop_front().unwrap_or(MockReply::Ack);
        match reply {
            MockReply::Ack => Ok(BatchAck::delivered(batch.batch_id, batch.last_seq)),
            MockReply::AckUpTo(seq) => Ok(BatchAck::delivered(batch.batch_id, seq)),
            MockReply::Nack(reason) => Ok(BatchAck::rejected(batch.batch_id, reason)),
            MockReply::Fail(message) => Err(SyncError::transport_retryable(message)),
            MockReply::Disconnect => {
                self.set_connected(false);
                Err(SyncError::NotConnected)
            }
            MockReply::Hang => {
                std::future::pending::<()>().await;
                Err(SyncError::Timeout)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.set_connected(false);
    }
}
