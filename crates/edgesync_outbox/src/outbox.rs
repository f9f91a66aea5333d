//! The per-edge event outbox.

use crate::backend::LogBackend;
use crate::cursor::{CursorStore, Direction};
use crate::error::{OutboxError, OutboxResult, StorageError};
use crate::record::{encode_base, encode_commit, encode_record, Record, RecordKind, RecordReader};
use crate::storage::OutboxStorage;
use edgesync_protocol::{compact_pending, EdgeEvent, EdgeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Sequence ids assigned by one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    /// First assigned id.
    pub first_seq: u64,
    /// Last assigned id.
    pub last_seq: u64,
    /// Number of events appended.
    pub count: usize,
}

impl AppendReceipt {
    /// True when the batch was empty and nothing was written.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Result of a compaction or retention pass on one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionReport {
    /// Events removed.
    pub dropped: usize,
    /// Events still stored.
    pub retained: usize,
}

/// Snapshot of one edge's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeStats {
    /// Edge.
    pub edge_id: EdgeId,
    /// Last assigned sequence id, 0 if none.
    pub last_seq: u64,
    /// Downlink cursor.
    pub cursor: u64,
    /// Events after the cursor.
    pub pending: usize,
    /// Events stored, delivered or not.
    pub retained: usize,
}

struct LogState {
    backend: Box<dyn LogBackend>,
    /// Committed events ordered by `seq`.
    events: Vec<EdgeEvent>,
    next_seq: u64,
    /// Set when a failed append left bytes behind that could not be removed.
    poisoned: bool,
    /// Set once the edge was deleted; holders of a stale handle reopen.
    retired: bool,
}

impl LogState {
    fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    fn ensure_writable(&self, edge: EdgeId) -> OutboxResult<()> {
        if self.poisoned {
            return Err(OutboxError::LogPoisoned { edge });
        }
        Ok(())
    }

    fn index_after(&self, seq: u64) -> usize {
        self.events.partition_point(|e| e.seq <= seq)
    }

    fn pending_after(&self, cursor: u64) -> usize {
        self.events.len() - self.index_after(cursor)
    }

    /// Replaces the log with `events`, keeping `next_seq`.
    fn rewrite(&mut self, events: Vec<EdgeEvent>) -> OutboxResult<()> {
        let mut buf = Vec::new();
        encode_base(&mut buf, self.next_seq)?;
        if let Some(last) = events.last() {
            for event in &events {
                encode_record(&mut buf, RecordKind::Event, &event.encode()?)?;
            }
            encode_commit(&mut buf, last.seq)?;
        }
        self.backend.rewrite(&buf)?;
        self.events = events;
        Ok(())
    }
}

struct EdgeLog {
    state: RwLock<LogState>,
    notify: Arc<Notify>,
}

/// Durable, per-edge ordered queue of edge events.
///
/// Each edge has its own log and lock: appends to one edge are serialized,
/// appends to different edges never contend. Sequence ids start at 1 and
/// are assigned contiguously per append.
pub struct EventOutbox {
    storage: Arc<dyn OutboxStorage>,
    cursors: CursorStore,
    edges: RwLock<HashMap<EdgeId, Arc<EdgeLog>>>,
}

impl EventOutbox {
    /// Opens an outbox and recovers every edge log found in storage.
    pub fn open(storage: Arc<dyn OutboxStorage>) -> OutboxResult<Self> {
        let outbox = Self {
            cursors: CursorStore::new(storage.clone()),
            storage,
            edges: RwLock::new(HashMap::new()),
        };
        let edges = outbox.storage.list_edges()?;
        for edge in &edges {
            outbox.log(*edge)?;
        }
        info!(edges = edges.len(), "outbox opened");
        Ok(outbox)
    }

    /// The cursor store sharing this outbox's storage.
    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    fn log(&self, edge: EdgeId) -> OutboxResult<Arc<EdgeLog>> {
        if let Some(log) = self.edges.read().get(&edge) {
            return Ok(log.clone());
        }

        let mut edges = self.edges.write();
        if let Some(log) = edges.get(&edge) {
            return Ok(log.clone());
        }
        let backend = self.storage.open_log(edge)?;
        let state = recover(edge, backend)?;
        let log = Arc::new(EdgeLog {
            state: RwLock::new(state),
            notify: Arc::new(Notify::new()),
        });
        edges.insert(edge, log.clone());
        Ok(log)
    }

    /// Appends a batch of events to an edge's queue.
    ///
    /// Assigns contiguous sequence ids and returns once the batch is durable.
    /// On failure nothing is stored and no ids are consumed, so the caller
    /// can retry the same batch. If the partial write cannot be removed the
    /// log is poisoned and every later write fails with `LogPoisoned`
    /// until the outbox is reopened.
    pub fn append(&self, edge: EdgeId, events: Vec<EdgeEvent>) -> OutboxResult<AppendReceipt> {
        if let Some(foreign) = events.iter().find(|e| e.edge_id != edge) {
            return Err(OutboxError::EdgeMismatch {
                expected: edge,
                found: foreign.edge_id,
            });
        }

        let log = self.log(edge)?;
        let mut state = log.state.write();
        if state.retired {
            drop(state);
            return self.append(edge, events);
        }
        state.ensure_writable(edge)?;

        if events.is_empty() {
            return Ok(AppendReceipt {
                first_seq: state.next_seq,
                last_seq: state.last_seq(),
                count: 0,
            });
        }

        let first_seq = state.next_seq;
        let mut buf = Vec::new();
        let mut stamped = Vec::with_capacity(events.len());
        for (seq, event) in (first_seq..).zip(events) {
            let event = event.with_seq(seq);
            encode_record(&mut buf, RecordKind::Event, &event.encode()?)?;
            stamped.push(event);
        }
        let last_seq = first_seq + stamped.len() as u64 - 1;
        encode_commit(&mut buf, last_seq)?;

        let start_size = state.backend.size()?;
        let written = state
            .backend
            .append(&buf)
            .and_then(|_| state.backend.sync());
        if let Err(e) = written {
            error!(%edge, error = %e, "outbox append failed, rolling back");
            if let Err(rollback) = state.backend.truncate(start_size) {
                error!(%edge, error = %rollback, "outbox rollback failed, refusing writes until reopened");
                state.poisoned = true;
            }
            return Err(e.into());
        }

        let count = stamped.len();
        state.events.extend(stamped);
        state.next_seq = last_seq + 1;
        drop(state);

        debug!(%edge, first_seq, last_seq, "appended edge events");
        log.notify.notify_one();

        Ok(AppendReceipt {
            first_seq,
            last_seq,
            count,
        })
    }

    /// Reads up to `limit` events with `seq >= from_seq`, in order.
    pub fn read(&self, edge: EdgeId, from_seq: u64, limit: usize) -> OutboxResult<Vec<EdgeEvent>> {
        let log = self.log(edge)?;
        let state = log.state.read();
        let start = state.index_after(from_seq.saturating_sub(1));
        Ok(state.events[start..].iter().take(limit).cloned().collect())
    }

    /// Reads the next undelivered events, starting after the downlink cursor.
    pub fn read_pending(&self, edge: EdgeId, limit: usize) -> OutboxResult<Vec<EdgeEvent>> {
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        self.read(edge, cursor + 1, limit)
    }

    /// Last assigned sequence id, 0 if nothing was ever appended.
    pub fn last_sequence(&self, edge: EdgeId) -> OutboxResult<u64> {
        Ok(self.log(edge)?.state.read().last_seq())
    }

    /// Number of events after the downlink cursor.
    pub fn pending_count(&self, edge: EdgeId) -> OutboxResult<usize> {
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        Ok(self.log(edge)?.state.read().pending_after(cursor))
    }

    /// Snapshot of an edge's queue.
    pub fn stats(&self, edge: EdgeId) -> OutboxResult<EdgeStats> {
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        let log = self.log(edge)?;
        let state = log.state.read();
        Ok(EdgeStats {
            edge_id: edge,
            last_seq: state.last_seq(),
            cursor,
            pending: state.pending_after(cursor),
            retained: state.events.len(),
        })
    }

    /// Edges with a log.
    pub fn edges(&self) -> OutboxResult<Vec<EdgeId>> {
        let mut edges = self.storage.list_edges()?;
        for edge in self.edges.read().keys() {
            if !edges.contains(edge) {
                edges.push(*edge);
            }
        }
        edges.sort();
        Ok(edges)
    }

    /// Returns the signal fired after every append to `edge`.
    ///
    /// Uses `notify_one`, so an append that lands while nobody waits is not
    /// lost: the next `notified().await` completes immediately.
    pub fn subscribe(&self, edge: EdgeId) -> OutboxResult<Arc<Notify>> {
        Ok(self.log(edge)?.notify.clone())
    }

    /// Moves the downlink cursor to `seq`.
    ///
    /// # Errors
    ///
    /// `CursorBeyondLog` if `seq` was never assigned, `CursorRegression` if
    /// it is behind the current cursor.
    pub fn acknowledge(&self, edge: EdgeId, seq: u64) -> OutboxResult<bool> {
        let last = self.last_sequence(edge)?;
        if seq > last {
            return Err(OutboxError::CursorBeyondLog {
                edge,
                requested: seq,
                last,
            });
        }
        self.cursors.advance(edge, Direction::Downlink, seq)
    }

    /// Drops stored events with `seq <= through`.
    ///
    /// # Errors
    ///
    /// `EdgeHasPendingEvents` if that would drop events past the downlink
    /// cursor.
    pub fn discard_through(&self, edge: EdgeId, through: u64) -> OutboxResult<CompactionReport> {
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        let log = self.log(edge)?;
        let mut state = log.state.write();
        if state.retired {
            drop(state);
            return self.discard_through(edge, through);
        }
        state.ensure_writable(edge)?;

        if through > cursor {
            let undelivered = state.index_after(through) - state.index_after(cursor);
            if undelivered > 0 {
                return Err(OutboxError::EdgeHasPendingEvents {
                    edge,
                    pending: undelivered,
                });
            }
        }

        let split = state.index_after(through);
        if split == 0 {
            return Ok(CompactionReport {
                dropped: 0,
                retained: state.events.len(),
            });
        }
        let remaining = state.events[split..].to_vec();
        state.rewrite(remaining)?;

        info!(%edge, through, dropped = split, "discarded delivered events");
        Ok(CompactionReport {
            dropped: split,
            retained: state.events.len(),
        })
    }

    /// Computes what [`compact`](Self::compact) would drop, without writing.
    pub fn compaction_preview(&self, edge: EdgeId) -> OutboxResult<CompactionReport> {
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        let log = self.log(edge)?;
        let state = log.state.read();
        let split = state.index_after(cursor);
        let compacted = compact_pending(state.events[split..].to_vec());
        Ok(CompactionReport {
            dropped: compacted.dropped,
            retained: state.events.len() - compacted.dropped,
        })
    }

    /// Collapses superseded undelivered events.
    ///
    /// Delivered events and sequence ids of survivors are untouched, so
    /// reads afterwards may see gaps in the ids.
    pub fn compact(&self, edge: EdgeId) -> OutboxResult<CompactionReport> {
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        let log = self.log(edge)?;
        let mut state = log.state.write();
        if state.retired {
            drop(state);
            return self.compact(edge);
        }
        state.ensure_writable(edge)?;

        let split = state.index_after(cursor);
        let compacted = compact_pending(state.events[split..].to_vec());
        if compacted.dropped > 0 {
            let mut events = state.events[..split].to_vec();
            events.extend(compacted.events);
            state.rewrite(events)?;
            info!(%edge, dropped = compacted.dropped, "compacted pending events");
        }

        Ok(CompactionReport {
            dropped: compacted.dropped,
            retained: state.events.len(),
        })
    }

    /// Removes an edge's log and cursors.
    ///
    /// The pending check and the removal happen under the edge's write
    /// lock, so an append racing with the delete either lands before the
    /// check and is counted, or lands afterwards in a fresh log.
    ///
    /// # Errors
    ///
    /// `EdgeHasPendingEvents` if undelivered events remain and
    /// `discard_pending` is false.
    pub fn delete_edge(&self, edge: EdgeId, discard_pending: bool) -> OutboxResult<()> {
        let log = self.log(edge)?;
        let mut edges = self.edges.write();
        let mut state = log.state.write();
        if state.retired {
            drop(state);
            drop(edges);
            return self.delete_edge(edge, discard_pending);
        }
        let cursor = self.cursors.get(edge, Direction::Downlink)?;
        let pending = state.pending_after(cursor);
        if pending > 0 && !discard_pending {
            return Err(OutboxError::EdgeHasPendingEvents { edge, pending });
        }

        self.storage.remove_edge(edge)?;
        state.retired = true;
        edges.remove(&edge);
        self.cursors.forget(edge);
        if pending > 0 {
            warn!(%edge, pending, "deleted edge with undelivered events");
        } else {
            info!(%edge, "deleted edge outbox");
        }
        Ok(())
    }
}

/// Replays a log, dropping a torn tail.
fn recover(edge: EdgeId, mut backend: Box<dyn LogBackend>) -> OutboxResult<LogState> {
    let bytes = backend.read_all()?;
    let mut reader = RecordReader::new(&bytes);
    let mut events = Vec::new();
    let mut uncommitted = Vec::new();
    let mut next_seq = 1;
    let mut last_event_seq = 0;
    let mut valid_len = 0;

    while let Some(record) = reader.next_record()? {
        match record {
            Record::Event(payload) => {
                let event = EdgeEvent::decode(payload)?;
                if event.seq <= last_event_seq {
                    return Err(StorageError::corrupted(format!(
                        "event {} follows event {last_event_seq}",
                        event.seq
                    ))
                    .into());
                }
                last_event_seq = event.seq;
                uncommitted.push(event);
            }
            Record::Commit { last_seq } => {
                if uncommitted.last().map(|e: &EdgeEvent| e.seq) != Some(last_seq) {
                    return Err(StorageError::corrupted(format!(
                        "commit for {last_seq} does not close the preceding events"
                    ))
                    .into());
                }
                events.append(&mut uncommitted);
                next_seq = next_seq.max(last_seq + 1);
                valid_len = reader.offset();
            }
            Record::Base { next_seq: base } => {
                if !uncommitted.is_empty() {
                    return Err(StorageError::corrupted("base record inside a batch").into());
                }
                next_seq = base;
                valid_len = reader.offset();
            }
        }
    }

    if valid_len < bytes.len() {
        warn!(
            %edge,
            discarded_bytes = bytes.len() - valid_len,
            discarded_events = uncommitted.len(),
            "discarding torn outbox tail"
        );
        backend.truncate(valid_len as u64)?;
    }

    debug!(%edge, events = events.len(), next_seq, "recovered edge log");
    Ok(LogState {
        backend,
        events,
        next_seq,
        poisoned: false,
        retired: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::DirStorage;
    use crate::storage::MemoryStorage;
    use edgesync_protocol::{EdgeEventAction, EntityId, EntityType, TenantId};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn event(edge: EdgeId) -> EdgeEvent {
        EdgeEvent::added(TenantId::SYS, edge, EntityType::Device, EntityId::new(), None)
    }

    fn update(edge: EdgeId, entity: EntityId) -> EdgeEvent {
        EdgeEvent::new(
            TenantId::SYS,
            edge,
            EntityType::Device,
            EdgeEventAction::Updated,
            entity,
            None,
        )
    }

    fn batch(edge: EdgeId, n: usize) -> Vec<EdgeEvent> {
        (0..n).map(|_| event(edge)).collect()
    }

    fn memory_outbox() -> (Arc<MemoryStorage>, EventOutbox) {
        let storage = Arc::new(MemoryStorage::new());
        let outbox = EventOutbox::open(storage.clone()).unwrap();
        (storage, outbox)
    }

    fn seqs(events: &[EdgeEvent]) -> Vec<u64> {
        events.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn append_assigns_contiguous_ids() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();

        let first = outbox.append(edge, batch(edge, 3)).unwrap();
        assert_eq!((first.first_seq, first.last_seq, first.count), (1, 3, 3));
        let second = outbox.append(edge, batch(edge, 2)).unwrap();
        assert_eq!((second.first_seq, second.last_seq), (4, 5));

        let all = outbox.read(edge, 1, 100).unwrap();
        assert_eq!(seqs(&all), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_append_writes_nothing() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        let receipt = outbox.append(edge, Vec::new()).unwrap();
        assert!(receipt.is_empty());
        assert!(storage.backend(edge).data().is_empty());
    }

    #[test]
    fn read_respects_from_and_limit() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 10)).unwrap();

        assert_eq!(seqs(&outbox.read(edge, 4, 3).unwrap()), vec![4, 5, 6]);
        assert!(outbox.read(edge, 11, 5).unwrap().is_empty());
        assert_eq!(seqs(&outbox.read(edge, 0, 2).unwrap()), vec![1, 2]);
    }

    #[test]
    fn edges_are_independent() {
        let (_, outbox) = memory_outbox();
        let a = EdgeId::new();
        let b = EdgeId::new();
        outbox.append(a, batch(a, 2)).unwrap();
        let receipt = outbox.append(b, batch(b, 1)).unwrap();
        assert_eq!(receipt.first_seq, 1);
        assert_eq!(outbox.edges().unwrap().len(), 2);
    }

    #[test]
    fn foreign_event_is_rejected() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        let err = outbox.append(edge, vec![event(EdgeId::new())]).unwrap_err();
        assert!(matches!(err, OutboxError::EdgeMismatch { .. }));
        assert_eq!(outbox.last_sequence(edge).unwrap(), 0);
    }

    #[test]
    fn failed_append_consumes_no_ids() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 2)).unwrap();
        let size_before = storage.backend(edge).data().len();

        storage.backend(edge).fail_next_appends(1);
        let err = outbox.append(edge, batch(edge, 3)).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(storage.backend(edge).data().len(), size_before);
        assert_eq!(outbox.last_sequence(edge).unwrap(), 2);

        let retry = outbox.append(edge, batch(edge, 3)).unwrap();
        assert_eq!((retry.first_seq, retry.last_seq), (3, 5));
    }

    #[test]
    fn reopen_recovers_events() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        let appended = batch(edge, 4);
        let uids: Vec<_> = appended.iter().map(|e| e.uid).collect();
        outbox.append(edge, appended).unwrap();
        drop(outbox);

        let reopened = EventOutbox::open(storage).unwrap();
        let events = reopened.read(edge, 1, 10).unwrap();
        assert_eq!(seqs(&events), vec![1, 2, 3, 4]);
        assert_eq!(events.iter().map(|e| e.uid).collect::<Vec<_>>(), uids);
        assert_eq!(reopened.append(edge, batch(edge, 1)).unwrap().first_seq, 5);
    }

    #[test]
    fn torn_tail_is_discarded_on_recovery() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 2)).unwrap();
        drop(outbox);

        // An uncommitted event followed by half a record.
        let backend = storage.backend(edge);
        let mut bytes = backend.data();
        let committed_len = bytes.len();
        let stray = event(edge).with_seq(3).encode().unwrap();
        encode_record(&mut bytes, RecordKind::Event, &stray).unwrap();
        bytes.extend_from_slice(b"EOBX\x01");
        let mut restored = backend.clone();
        restored.rewrite(&bytes).unwrap();

        let reopened = EventOutbox::open(storage.clone()).unwrap();
        assert_eq!(reopened.last_sequence(edge).unwrap(), 2);
        assert_eq!(storage.backend(edge).data().len(), committed_len);
        assert_eq!(reopened.append(edge, batch(edge, 1)).unwrap().first_seq, 3);
    }

    #[test]
    fn checksum_damage_is_reported() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 2)).unwrap();
        drop(outbox);

        let mut backend = storage.backend(edge);
        let mut bytes = backend.data();
        bytes[20] ^= 0xff;
        backend.rewrite(&bytes).unwrap();

        assert!(matches!(
            EventOutbox::open(storage),
            Err(OutboxError::Storage(StorageError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn failed_rollback_refuses_writes_until_reopen() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 1)).unwrap();

        let backend = storage.backend(edge);
        backend.fail_next_syncs(1);
        backend.fail_next_truncates(1);
        let err = outbox.append(edge, batch(edge, 2)).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(outbox.last_sequence(edge).unwrap(), 1);

        assert!(matches!(
            outbox.append(edge, batch(edge, 2)),
            Err(OutboxError::LogPoisoned { .. })
        ));
        assert!(matches!(
            outbox.compact(edge),
            Err(OutboxError::LogPoisoned { .. })
        ));
        drop(outbox);

        // the batch reported as failed did reach the log
        let reopened = EventOutbox::open(storage).unwrap();
        assert_eq!(seqs(&reopened.read(edge, 1, 10).unwrap()), vec![1, 2, 3]);
        let receipt = reopened.append(edge, batch(edge, 1)).unwrap();
        assert_eq!(receipt.first_seq, 4);
        assert_eq!(seqs(&reopened.read(edge, 1, 10).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn recovery_rejects_reused_sequence_ids() {
        let storage = Arc::new(MemoryStorage::new());
        let edge = EdgeId::new();
        let mut buf = Vec::new();
        for seq in [1u64, 2, 3, 2, 3] {
            let payload = event(edge).with_seq(seq).encode().unwrap();
            encode_record(&mut buf, RecordKind::Event, &payload).unwrap();
            encode_commit(&mut buf, seq).unwrap();
        }
        storage.backend(edge).append(&buf).unwrap();

        assert!(matches!(
            EventOutbox::open(storage),
            Err(OutboxError::Storage(StorageError::Corrupted(_)))
        ));
    }

    #[test]
    fn append_racing_delete_is_never_lost() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 1)).unwrap();
        outbox.acknowledge(edge, 1).unwrap();
        let marker = event(edge);
        let marker_uid = marker.uid;

        let log = outbox.log(edge).unwrap();
        let guard = log.state.write();
        let deleted = std::thread::scope(|scope| {
            let append = scope.spawn(|| outbox.append(edge, vec![marker]));
            let delete = scope.spawn(|| outbox.delete_edge(edge, false));
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(guard);
            append.join().unwrap().unwrap();
            delete.join().unwrap()
        });

        // whichever ran first, the appended event is still queued
        match deleted {
            Ok(()) | Err(OutboxError::EdgeHasPendingEvents { .. }) => {}
            Err(e) => panic!("unexpected delete failure: {e}"),
        }
        let pending = outbox.read_pending(edge, 10).unwrap();
        assert!(pending.iter().any(|e| e.uid == marker_uid));
    }

    #[test]
    fn stale_handle_is_retired_by_delete() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        let stale = outbox.log(edge).unwrap();
        outbox.delete_edge(edge, false).unwrap();
        assert!(stale.state.read().retired);

        let receipt = outbox.append(edge, batch(edge, 2)).unwrap();
        assert_eq!((receipt.first_seq, receipt.last_seq), (1, 2));
        assert!(stale.state.read().events.is_empty());
    }

    #[test]
    fn acknowledge_moves_cursor_forward_only() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 5)).unwrap();

        assert!(outbox.acknowledge(edge, 3).unwrap());
        assert_eq!(outbox.pending_count(edge).unwrap(), 2);
        assert_eq!(seqs(&outbox.read_pending(edge, 10).unwrap()), vec![4, 5]);

        assert!(matches!(
            outbox.acknowledge(edge, 2),
            Err(OutboxError::CursorRegression { .. })
        ));
        assert!(matches!(
            outbox.acknowledge(edge, 6),
            Err(OutboxError::CursorBeyondLog { last: 5, .. })
        ));
    }

    #[test]
    fn discard_keeps_next_sequence() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 5)).unwrap();
        outbox.acknowledge(edge, 5).unwrap();

        let report = outbox.discard_through(edge, 5).unwrap();
        assert_eq!(report, CompactionReport { dropped: 5, retained: 0 });
        drop(outbox);

        let reopened = EventOutbox::open(storage).unwrap();
        assert_eq!(reopened.last_sequence(edge).unwrap(), 5);
        assert_eq!(reopened.append(edge, batch(edge, 1)).unwrap().first_seq, 6);
    }

    #[test]
    fn discard_refuses_undelivered() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 5)).unwrap();
        outbox.acknowledge(edge, 2).unwrap();

        assert!(matches!(
            outbox.discard_through(edge, 4),
            Err(OutboxError::EdgeHasPendingEvents { pending: 2, .. })
        ));
        assert_eq!(outbox.discard_through(edge, 2).unwrap().dropped, 2);
        assert_eq!(seqs(&outbox.read(edge, 1, 10).unwrap()), vec![3, 4, 5]);
    }

    #[test]
    fn compact_collapses_pending_updates() {
        let (storage, outbox) = memory_outbox();
        let edge = EdgeId::new();
        let entity = EntityId::new();
        outbox
            .append(
                edge,
                vec![
                    update(edge, entity),
                    update(edge, entity),
                    update(edge, entity),
                    update(edge, entity),
                ],
            )
            .unwrap();
        outbox.acknowledge(edge, 1).unwrap();

        assert_eq!(outbox.compaction_preview(edge).unwrap().dropped, 2);
        let report = outbox.compact(edge).unwrap();
        assert_eq!(report, CompactionReport { dropped: 2, retained: 2 });
        assert_eq!(seqs(&outbox.read(edge, 1, 10).unwrap()), vec![1, 4]);
        drop(outbox);

        let reopened = EventOutbox::open(storage).unwrap();
        assert_eq!(seqs(&reopened.read(edge, 1, 10).unwrap()), vec![1, 4]);
        assert_eq!(reopened.append(edge, batch(edge, 1)).unwrap().first_seq, 5);
    }

    #[test]
    fn delete_guards_pending_events() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 2)).unwrap();

        assert!(matches!(
            outbox.delete_edge(edge, false),
            Err(OutboxError::EdgeHasPendingEvents { pending: 2, .. })
        ));
        outbox.acknowledge(edge, 2).unwrap();
        outbox.delete_edge(edge, false).unwrap();
        assert!(outbox.edges().unwrap().is_empty());
    }

    #[test]
    fn forced_delete_discards() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        outbox.append(edge, batch(edge, 2)).unwrap();
        outbox.delete_edge(edge, true).unwrap();
        assert_eq!(outbox.last_sequence(edge).unwrap(), 0);
    }

    #[test]
    fn append_notifies_subscriber() {
        let (_, outbox) = memory_outbox();
        let edge = EdgeId::new();
        let notify = outbox.subscribe(edge).unwrap();
        outbox.append(edge, batch(edge, 1)).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
                .await
                .unwrap();
        });
    }

    #[test]
    fn directory_outbox_survives_restart() {
        let temp = tempdir().unwrap();
        let edge = EdgeId::new();

        {
            let storage = Arc::new(DirStorage::open(temp.path(), true).unwrap());
            let outbox = EventOutbox::open(storage).unwrap();
            outbox.append(edge, batch(edge, 3)).unwrap();
            outbox.acknowledge(edge, 2).unwrap();
        }

        let storage = Arc::new(DirStorage::open(temp.path(), true).unwrap());
        let outbox = EventOutbox::open(storage).unwrap();
        let stats = outbox.stats(edge).unwrap();
        assert_eq!(stats.last_seq, 3);
        assert_eq!(stats.cursor, 2);
        assert_eq!(stats.pending, 1);
    }

    proptest! {
        #[test]
        fn ids_stay_increasing_through_compaction_and_reopen(
            batches in proptest::collection::vec(
                proptest::collection::vec(0usize..3, 0..6),
                1..8,
            ),
            delivered_ratio in 0.0f64..1.0,
        ) {
            let (storage, outbox) = memory_outbox();
            let edge = EdgeId::new();
            let entities: Vec<EntityId> = (0..3).map(|_| EntityId::new()).collect();

            let mut total = 0u64;
            for targets in &batches {
                let events: Vec<EdgeEvent> = targets
                    .iter()
                    .map(|i| update(edge, entities[*i]))
                    .collect();
                total += events.len() as u64;
                outbox.append(edge, events).unwrap();
            }
            prop_assert_eq!(outbox.last_sequence(edge).unwrap(), total);

            let delivered = (total as f64 * delivered_ratio) as u64;
            if delivered > 0 {
                outbox.acknowledge(edge, delivered).unwrap();
            }
            let report = outbox.compact(edge).unwrap();
            // at most one pending update per entity survives
            prop_assert!(outbox.pending_count(edge).unwrap() <= entities.len());

            let before = outbox.read(edge, 0, usize::MAX).unwrap();
            prop_assert_eq!(before.len(), report.retained);
            prop_assert!(before.windows(2).all(|w| w[0].seq < w[1].seq));
            drop(outbox);

            let reopened = EventOutbox::open(storage).unwrap();
            prop_assert_eq!(reopened.read(edge, 0, usize::MAX).unwrap(), before);
            prop_assert_eq!(reopened.last_sequence(edge).unwrap(), total);
        }
    }
}
