//! Retention policy for undelivered events.
//!
//! While an edge is offline its queue keeps growing. Consecutive UPDATED
//! events for the same entity carry no information beyond the latest one,
//! so they can be collapsed without changing what the edge ends up with.

use crate::event::{EdgeEvent, EdgeEventAction, EntityType};
use crate::ids::EntityId;
use std::collections::HashMap;

/// Outcome of a compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compacted {
    /// Surviving events, in their original order.
    pub events: Vec<EdgeEvent>,
    /// Number of events dropped.
    pub dropped: usize,
}

/// Collapses runs of UPDATED events per entity into the latest one.
///
/// A run is broken by any other action on the same entity, so
/// `ADDED, UPDATED, DELETED, ADDED, UPDATED` is left untouched. Order and
/// sequence ids of the surviving events are preserved.
pub fn compact_pending(events: Vec<EdgeEvent>) -> Compacted {
    let total = events.len();
    // For each entity: whether a later UPDATED in the same run was kept.
    let mut later_update: HashMap<(EntityType, EntityId), bool> = HashMap::new();
    let mut kept = Vec::with_capacity(total);

    for event in events.into_iter().rev() {
        let key = (event.entity_type, event.entity_id);
        if event.action == EdgeEventAction::Updated {
            let seen = later_update.entry(key).or_insert(false);
            if *seen {
                continue;
            }
            *seen = true;
        } else {
            later_update.insert(key, false);
        }
        kept.push(event);
    }

    kept.reverse();
    Compacted {
        dropped: total - kept.len(),
        events: kept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{EdgeId, TenantId};

    fn ev(seq: u64, entity: EntityId, action: EdgeEventAction) -> EdgeEvent {
        EdgeEvent::new(
            TenantId::SYS,
            EdgeId::from_uuid(uuid::Uuid::nil()),
            EntityType::Device,
            action,
            entity,
            Some(vec![seq as u8]),
        )
        .with_seq(seq)
    }

    fn seqs(c: &Compacted) -> Vec<u64> {
        c.events.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn keeps_latest_update() {
        let a = EntityId::new();
        let out = compact_pending(vec![
            ev(1, a, EdgeEventAction::Updated),
            ev(2, a, EdgeEventAction::Updated),
            ev(3, a, EdgeEventAction::Updated),
        ]);
        assert_eq!(seqs(&out), vec![3]);
        assert_eq!(out.dropped, 2);
    }

    #[test]
    fn other_actions_break_runs() {
        let a = EntityId::new();
        let out = compact_pending(vec![
            ev(1, a, EdgeEventAction::Added),
            ev(2, a, EdgeEventAction::Updated),
            ev(3, a, EdgeEventAction::Deleted),
            ev(4, a, EdgeEventAction::Added),
            ev(5, a, EdgeEventAction::Updated),
        ]);
        assert_eq!(seqs(&out), vec![1, 2, 3, 4, 5]);
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn entities_are_independent() {
        let a = EntityId::new();
        let b = EntityId::new();
        let out = compact_pending(vec![
            ev(1, a, EdgeEventAction::Updated),
            ev(2, b, EdgeEventAction::Updated),
            ev(3, a, EdgeEventAction::Updated),
            ev(4, b, EdgeEventAction::CredentialsUpdated),
        ]);
        assert_eq!(seqs(&out), vec![2, 3, 4]);
    }

    #[test]
    fn empty_input() {
        let out = compact_pending(Vec::new());
        assert!(out.events.is_empty());
        assert_eq!(out.dropped, 0);
    }
}
