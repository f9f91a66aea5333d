//! Dump command implementation.

use super::{open_outbox, require_edge, CliResult, OutputFormat};
use edgesync_outbox::EventOutbox;
use edgesync_protocol::{EdgeEvent, EdgeId};
use serde::Serialize;
use std::path::Path;

/// One stored event, as printed.
#[derive(Debug, Serialize)]
pub struct EventInfo {
    /// Sequence id.
    pub seq: u64,
    /// Stable event id.
    pub uid: String,
    /// Entity type.
    pub entity_type: &'static str,
    /// Action.
    pub action: &'static str,
    /// Entity id.
    pub entity_id: String,
    /// Creation time, ms since the epoch.
    pub created_at: u64,
    /// Body size in bytes, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<usize>,
    /// True if the edge has acknowledged this event.
    pub delivered: bool,
}

impl EventInfo {
    fn new(event: &EdgeEvent, cursor: u64) -> Self {
        Self {
            seq: event.seq,
            uid: event.uid.to_string(),
            entity_type: event.entity_type.as_str(),
            action: event.action.as_str(),
            entity_id: event.entity_id.to_string(),
            created_at: event.created_at,
            body_size: event.body.as_ref().map(Vec::len),
            delivered: event.seq <= cursor,
        }
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    edge: EdgeId,
    from: u64,
    limit: Option<usize>,
    format: OutputFormat,
) -> CliResult<()> {
    let outbox = open_outbox(path)?;
    let events = dump(&outbox, edge, from, limit)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
        OutputFormat::Text => print_text_output(&events),
    }
    Ok(())
}

/// Reads stored events of `edge` starting at `from`.
pub fn dump(
    outbox: &EventOutbox,
    edge: EdgeId,
    from: u64,
    limit: Option<usize>,
) -> CliResult<Vec<EventInfo>> {
    require_edge(outbox, edge)?;
    let cursor = outbox.stats(edge)?.cursor;
    let events = outbox.read(edge, from, limit.unwrap_or(usize::MAX))?;
    Ok(events.iter().map(|e| EventInfo::new(e, cursor)).collect())
}

fn print_text_output(events: &[EventInfo]) {
    for event in events {
        let marker = if event.delivered { "✓" } else { " " };
        let body = event
            .body_size
            .map(|n| format!(" body={n}B"))
            .unwrap_or_default();
        println!(
            "{marker} #{:<8} {:<12} {:<20} {}{body}",
            event.seq, event.action, event.entity_type, event.entity_id
        );
    }
    println!();
    println!("{} events", events.len());
}
