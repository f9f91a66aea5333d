//! Frame-level uplink session for one connected edge.

use crate::error::{ServerError, ServerResult};
use crate::handler::UplinkHandler;
use edgesync_protocol::{BatchAck, EdgeId, ProtocolErrorFrame, SyncMessage, TenantId, UplinkBatch};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Response to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReply {
    /// Encoded frame to send back.
    pub frame: Vec<u8>,
    /// True if the connection should be closed after sending.
    pub teardown: bool,
}

/// Why a served session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Cancelled by the caller.
    Cancelled,
    /// The edge side went away.
    Closed,
}

/// Decodes uplink frames of one edge and answers each of them.
///
/// Batch ids must increase. A batch carrying the id of the last
/// accepted batch is a redelivery and is re-applied, which is harmless
/// because items are deduplicated by message id.
pub struct UplinkSession {
    handler: Arc<UplinkHandler>,
    tenant: TenantId,
    edge: EdgeId,
    last_batch: Option<u64>,
    violations: u32,
}

impl UplinkSession {
    /// Creates a session.
    pub fn new(handler: Arc<UplinkHandler>, tenant: TenantId, edge: EdgeId) -> Self {
        Self {
            handler,
            tenant,
            edge,
            last_batch: None,
            violations: 0,
        }
    }

    /// Edge served by this session.
    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    /// Id of the last acknowledged batch.
    pub fn last_batch(&self) -> Option<u64> {
        self.last_batch
    }

    /// Consecutive protocol violations so far.
    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Handles one inbound frame.
    ///
    /// # Errors
    ///
    /// Only platform-side failures and encoding of the reply itself are
    /// returned as errors. Anything the edge did wrong is answered with
    /// a protocol-error frame.
    pub fn handle_frame(&mut self, frame: &[u8]) -> ServerResult<SessionReply> {
        let batch = match SyncMessage::decode_frame(frame) {
            Ok(SyncMessage::Uplink(batch)) => batch,
            Ok(other) => {
                return self.violation(
                    None,
                    format!("unexpected frame type {}", other.type_code()),
                )
            }
            Err(e) => return self.violation(None, format!("malformed frame: {e}")),
        };

        if batch.edge_id != self.edge {
            return self.violation(
                Some(batch.batch_id),
                format!("batch for edge {} on session of {}", batch.edge_id, self.edge),
            );
        }
        if let Some(last) = self.last_batch {
            if batch.batch_id < last {
                return self.violation(
                    Some(batch.batch_id),
                    format!("batch {} out of order, last was {last}", batch.batch_id),
                );
            }
            if batch.batch_id == last {
                debug!(edge_id = %self.edge, batch_id = last, "uplink batch redelivered");
            }
        }

        self.apply(&batch)
    }

    fn apply(&mut self, batch: &UplinkBatch) -> ServerResult<SessionReply> {
        match self.handler.handle_batch(self.tenant, batch) {
            Ok(ack) => {
                self.violations = 0;
                self.last_batch = Some(batch.batch_id);
                Ok(SessionReply {
                    frame: SyncMessage::Ack(ack).encode_frame()?,
                    teardown: false,
                })
            }
            Err(ServerError::NotOwner { edge }) => {
                info!(edge_id = %edge, "edge owned elsewhere, closing uplink session");
                let ack = BatchAck::rejected(batch.batch_id, "edge owned by another node");
                Ok(SessionReply {
                    frame: SyncMessage::Ack(ack).encode_frame()?,
                    teardown: true,
                })
            }
            Err(e) if e.is_client_error() => self.violation(Some(batch.batch_id), e.to_string()),
            Err(e) => Err(e),
        }
    }

    fn violation(&mut self, batch_id: Option<u64>, reason: String) -> ServerResult<SessionReply> {
        self.violations += 1;
        let limit = self.handler.config().max_protocol_violations;
        warn!(
            edge_id = %self.edge,
            batch_id = ?batch_id,
            violations = self.violations,
            limit,
            reason = %reason,
            "uplink protocol violation"
        );
        let frame = SyncMessage::Error(ProtocolErrorFrame::new(batch_id, reason)).encode_frame()?;
        Ok(SessionReply {
            frame,
            teardown: self.violations >= limit,
        })
    }

    /// Serves frames from `inbound`, writing replies to `outbound`.
    ///
    /// # Errors
    ///
    /// `TooManyViolations` or `NotOwner` when the session is torn down,
    /// or a platform-side failure.
    pub async fn serve(
        mut self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> ServerResult<SessionEnd> {
        info!(edge_id = %self.edge, "uplink session started");
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => return Ok(SessionEnd::Closed),
                },
            };

            let reply = self.handle_frame(&frame)?;
            if outbound.send(reply.frame).await.is_err() {
                return Ok(SessionEnd::Closed);
            }
            if reply.teardown {
                let limit = self.handler.config().max_protocol_violations;
                return Err(if self.violations >= limit {
                    ServerError::TooManyViolations {
                        edge: self.edge,
                        count: self.violations,
                    }
                } else {
                    ServerError::NotOwner { edge: self.edge }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::MemoryPlatformStore;
    use edgesync_engine::{NodeId, PartitionRouter};
    use edgesync_protocol::{
        EntityPayload, EntityType, ItemOutcome, OriginatorRef, SubMessage, UpdateMsgType,
        UpdatePayload,
    };

    fn session(max_violations: u32) -> UplinkSession {
        let handler = Arc::new(UplinkHandler::new(
            Arc::new(MemoryPlatformStore::new()),
            Arc::new(PartitionRouter::standalone(NodeId::new("node-1"))),
            ServerConfig::new().with_max_protocol_violations(max_violations),
        ));
        UplinkSession::new(handler, TenantId::new(), EdgeId::new())
    }

    fn uplink(edge: EdgeId, batch_id: u64) -> Vec<u8> {
        let msg = SubMessage::new(
            EntityType::Device,
            OriginatorRef::Name("sensor".into()),
            UpdateMsgType::EntityCreated,
            UpdatePayload::Entity(EntityPayload::new("sensor", "temp")),
        );
        SyncMessage::Uplink(UplinkBatch::new(batch_id, edge, vec![msg]))
            .encode_frame()
            .unwrap()
    }

    fn decode(reply: &SessionReply) -> SyncMessage {
        SyncMessage::decode_frame(&reply.frame).unwrap()
    }

    #[test]
    fn valid_batch_is_acked() {
        let mut s = session(3);
        let reply = s.handle_frame(&uplink(s.edge(), 1)).unwrap();

        match decode(&reply) {
            SyncMessage::Ack(ack) => {
                assert_eq!(ack.batch_id, 1);
                assert!(ack.accepted);
                assert_eq!(ack.statuses[0].outcome, ItemOutcome::Applied);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        assert!(!reply.teardown);
        assert_eq!(s.last_batch(), Some(1));
    }

    #[test]
    fn redelivered_batch_is_reacked_as_duplicate() {
        let mut s = session(3);
        let frame = uplink(s.edge(), 4);
        s.handle_frame(&frame).unwrap();
        let reply = s.handle_frame(&frame).unwrap();

        match decode(&reply) {
            SyncMessage::Ack(ack) => {
                assert_eq!(ack.batch_id, 4);
                assert_eq!(ack.statuses[0].outcome, ItemOutcome::Duplicate);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(s.violations(), 0);
    }

    #[test]
    fn out_of_order_batch_gets_error_frame() {
        let mut s = session(3);
        s.handle_frame(&uplink(s.edge(), 5)).unwrap();
        let reply = s.handle_frame(&uplink(s.edge(), 2)).unwrap();

        match decode(&reply) {
            SyncMessage::Error(err) => assert_eq!(err.batch_id, Some(2)),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert_eq!(s.violations(), 1);
        assert_eq!(s.last_batch(), Some(5));
    }

    #[test]
    fn repeated_violations_tear_down() {
        let mut s = session(2);
        let first = s.handle_frame(b"\x02garbage").unwrap();
        assert!(!first.teardown);
        let second = s.handle_frame(&[]).unwrap();
        assert!(second.teardown);
    }

    #[test]
    fn good_batch_resets_violation_count() {
        let mut s = session(2);
        s.handle_frame(&uplink(EdgeId::new(), 1)).unwrap();
        assert_eq!(s.violations(), 1);
        s.handle_frame(&uplink(s.edge(), 1)).unwrap();
        assert_eq!(s.violations(), 0);
        let reply = s.handle_frame(&uplink(EdgeId::new(), 2)).unwrap();
        assert!(!reply.teardown);
    }

    #[tokio::test]
    async fn serve_stops_after_teardown() {
        let s = session(1);
        let edge = s.edge();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let task = tokio::spawn(s.serve(in_rx, out_tx, CancellationToken::new()));

        in_tx.send(uplink(edge, 1)).await.unwrap();
        assert!(matches!(
            SyncMessage::decode_frame(&out_rx.recv().await.unwrap()).unwrap(),
            SyncMessage::Ack(_)
        ));

        in_tx.send(b"not a frame".to_vec()).await.unwrap();
        assert!(matches!(
            SyncMessage::decode_frame(&out_rx.recv().await.unwrap()).unwrap(),
            SyncMessage::Error(_)
        ));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ServerError::TooManyViolations { count: 1, .. }));
    }

    #[tokio::test]
    async fn serve_ends_on_cancel_and_close() {
        let s = session(3);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(s.serve(in_rx, out_tx, cancel.clone()));
        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Cancelled);

        let s = session(3);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (in_tx2, in_rx2) = mpsc::channel::<Vec<u8>>(1);
        drop(in_tx2);
        let end = s.serve(in_rx2, out_tx, CancellationToken::new()).await.unwrap();
        assert_eq!(end, SessionEnd::Closed);
        drop(in_tx);
    }
}
