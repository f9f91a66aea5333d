//! Inspect command implementation.

use super::{open_outbox, require_edge, CliResult, OutputFormat};
use edgesync_outbox::EventOutbox;
use edgesync_protocol::EdgeId;
use serde::Serialize;
use std::path::Path;

/// Outbox inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Outbox directory.
    pub path: String,
    /// Undelivered events across all edges.
    pub total_pending: usize,
    /// Per-edge queue state, ordered by edge id.
    pub edges: Vec<EdgeSummary>,
}

/// Queue state of one edge.
#[derive(Debug, Serialize)]
pub struct EdgeSummary {
    /// Edge id.
    pub edge_id: String,
    /// Last assigned sequence id.
    pub last_seq: u64,
    /// Downlink cursor.
    pub cursor: u64,
    /// Events waiting for delivery.
    pub pending: usize,
    /// Events stored.
    pub retained: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, edge: Option<EdgeId>, format: OutputFormat) -> CliResult<()> {
    let outbox = open_outbox(path)?;
    let result = inspect(&outbox, path, edge)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects queue state of one edge or all of them.
pub fn inspect(outbox: &EventOutbox, path: &Path, edge: Option<EdgeId>) -> CliResult<InspectResult> {
    let mut edges = match edge {
        Some(edge) => {
            require_edge(outbox, edge)?;
            vec![edge]
        }
        None => outbox.edges()?,
    };
    edges.sort();

    let mut summaries = Vec::with_capacity(edges.len());
    for edge in edges {
        let stats = outbox.stats(edge)?;
        summaries.push(EdgeSummary {
            edge_id: stats.edge_id.to_string(),
            last_seq: stats.last_seq,
            cursor: stats.cursor,
            pending: stats.pending,
            retained: stats.retained,
        });
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        total_pending: summaries.iter().map(|s| s.pending).sum(),
        edges: summaries,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("EdgeSync Outbox Inspection");
    println!("==========================");
    println!();
    println!("Path:          {}", result.path);
    println!("Edges:         {}", result.edges.len());
    println!("Total pending: {}", result.total_pending);

    if result.edges.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<36}  {:>10}  {:>10}  {:>8}  {:>8}",
        "EDGE", "LAST SEQ", "CURSOR", "PENDING", "STORED"
    );
    for edge in &result.edges {
        println!(
            "{:<36}  {:>10}  {:>10}  {:>8}  {:>8}",
            edge.edge_id, edge.last_seq, edge.cursor, edge.pending, edge.retained
        );
    }
}
