//! Bounded per-edge memory of applied message ids.

use edgesync_protocol::EdgeId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Window {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

/// Remembers the most recent applied message ids of every edge.
///
/// Once an edge's window is full the oldest id is forgotten. The window
/// must be larger than any redelivery span, which is at most one batch.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    edges: Mutex<HashMap<EdgeId, Window>>,
}

impl DedupWindow {
    /// Creates a window holding up to `capacity` ids per edge.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the id was recorded for this edge.
    pub fn contains(&self, edge: EdgeId, msg_id: &Uuid) -> bool {
        self.edges
            .lock()
            .get(&edge)
            .is_some_and(|w| w.seen.contains(msg_id))
    }

    /// Records an id. Returns false if it was already present.
    pub fn record(&self, edge: EdgeId, msg_id: Uuid) -> bool {
        let mut edges = self.edges.lock();
        let window = edges.entry(edge).or_default();
        if !window.seen.insert(msg_id) {
            return false;
        }
        window.order.push_back(msg_id);
        while window.order.len() > self.capacity {
            if let Some(evicted) = window.order.pop_front() {
                window.seen.remove(&evicted);
            }
        }
        true
    }

    /// Number of ids remembered for an edge.
    pub fn len(&self, edge: EdgeId) -> usize {
        self.edges.lock().get(&edge).map_or(0, |w| w.order.len())
    }

    /// Forgets everything about an edge.
    pub fn forget(&self, edge: EdgeId) {
        self.edges.lock().remove(&edge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_and_contains() {
        let dedup = DedupWindow::new(4);
        let edge = EdgeId::new();
        let id = Uuid::new_v4();

        assert!(!dedup.contains(edge, &id));
        assert!(dedup.record(edge, id));
        assert!(dedup.contains(edge, &id));
        assert!(!dedup.record(edge, id));
        assert!(!dedup.contains(EdgeId::new(), &id));
    }

    #[test]
    fn oldest_ids_are_evicted() {
        let dedup = DedupWindow::new(2);
        let edge = EdgeId::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            dedup.record(edge, *id);
        }

        assert_eq!(dedup.len(edge), 2);
        assert!(!dedup.contains(edge, &ids[0]));
        assert!(dedup.contains(edge, &ids[1]));
        assert!(dedup.contains(edge, &ids[2]));
    }

    #[test]
    fn forget_clears_edge() {
        let dedup = DedupWindow::new(8);
        let edge = EdgeId::new();
        dedup.record(edge, Uuid::new_v4());
        dedup.forget(edge);
        assert_eq!(dedup.len(edge), 0);
    }

    proptest! {
        #[test]
        fn window_keeps_exactly_the_newest_ids(capacity in 1usize..16, count in 0usize..64) {
            let dedup = DedupWindow::new(capacity);
            let edge = EdgeId::new();
            let ids: Vec<Uuid> = (0..count).map(|_| Uuid::new_v4()).collect();
            for id in &ids {
                prop_assert!(dedup.record(edge, *id));
            }

            prop_assert_eq!(dedup.len(edge), count.min(capacity));
            let kept_from = count.saturating_sub(capacity);
            for (i, id) in ids.iter().enumerate() {
                prop_assert_eq!(dedup.contains(edge, id), i >= kept_from);
            }
        }
    }
}
