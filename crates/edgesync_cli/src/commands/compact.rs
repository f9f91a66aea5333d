//! Compact command implementation.

use super::{open_outbox, require_edge, CliResult};
use edgesync_outbox::EventOutbox;
use edgesync_protocol::EdgeId;
use std::path::Path;
use tracing::info;

/// What a compaction pass removed, or would remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Events stored before the pass.
    pub events_before: usize,
    /// Delivered events dropped by retention.
    pub delivered_dropped: usize,
    /// Superseded undelivered updates collapsed.
    pub superseded_dropped: usize,
    /// Events stored after the pass.
    pub events_after: usize,
}

/// Runs the compact command.
pub fn run(path: &Path, edge: EdgeId, keep_delivered: bool, dry_run: bool) -> CliResult<()> {
    let outbox = open_outbox(path)?;

    println!("Compacting outbox of edge {edge} at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(&outbox, edge, keep_delivered, dry_run)?;

    println!("Compaction:");
    println!("  Events before:       {}", stats.events_before);
    println!(
        "  Delivered dropped:   {}{}",
        stats.delivered_dropped,
        if keep_delivered { " (kept)" } else { "" }
    );
    println!("  Superseded dropped:  {}", stats.superseded_dropped);
    println!("  Events after:        {}", stats.events_after);
    Ok(())
}

/// Applies retention and compaction to one edge.
///
/// Retention drops events at or before the downlink cursor. Compaction
/// collapses runs of updates to the same entity among the rest.
pub fn compact(
    outbox: &EventOutbox,
    edge: EdgeId,
    keep_delivered: bool,
    dry_run: bool,
) -> CliResult<CompactStats> {
    require_edge(outbox, edge)?;
    let before = outbox.stats(edge)?;
    let delivered = before.retained - before.pending;

    if dry_run {
        let preview = outbox.compaction_preview(edge)?;
        let delivered_dropped = if keep_delivered { 0 } else { delivered };
        return Ok(CompactStats {
            events_before: before.retained,
            delivered_dropped,
            superseded_dropped: preview.dropped,
            events_after: before.retained - delivered_dropped - preview.dropped,
        });
    }

    let delivered_dropped = if keep_delivered {
        0
    } else {
        outbox.discard_through(edge, before.cursor)?.dropped
    };
    let report = outbox.compact(edge)?;
    info!(
        edge_id = %edge,
        delivered_dropped,
        superseded_dropped = report.dropped,
        "outbox compacted"
    );

    Ok(CompactStats {
        events_before: before.retained,
        delivered_dropped,
        superseded_dropped: report.dropped,
        events_after: report.retained,
    })
}
