//! EdgeSync CLI
//!
//! Command-line tools for EdgeSync outbox directories.
//!
//! # Commands
//!
//! - `inspect` - Per-edge sequence, cursor and pending counts
//! - `dump` - Print stored events of one edge
//! - `compact` - Drop delivered events and collapse superseded updates
//! - `version` - Print version information

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use edgesync_protocol::EdgeId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// EdgeSync outbox maintenance tools.
#[derive(Parser)]
#[command(name = "edgesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the outbox directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-edge queue state
    Inspect {
        /// Only this edge
        #[arg(short, long)]
        edge: Option<EdgeId>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print stored events of one edge
    Dump {
        /// Edge to dump
        #[arg(short, long)]
        edge: EdgeId,

        /// First sequence id
        #[arg(long, default_value = "0")]
        from: u64,

        /// Maximum number of events
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Apply retention and compaction to one edge
    Compact {
        /// Edge to compact
        #[arg(short, long)]
        edge: EdgeId,

        /// Keep delivered events
        #[arg(short, long)]
        keep_delivered: bool,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { edge, format } => {
            let path = cli.path.ok_or("Outbox path required for inspect")?;
            commands::inspect::run(&path, edge, format)?;
        }
        Commands::Dump {
            edge,
            from,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Outbox path required for dump")?;
            commands::dump::run(&path, edge, from, limit, format)?;
        }
        Commands::Compact {
            edge,
            keep_delivered,
            dry_run,
        } => {
            let path = cli.path.ok_or("Outbox path required for compact")?;
            commands::compact::run(&path, edge, keep_delivered, dry_run)?;
        }
        Commands::Version => {
            println!("EdgeSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Wire record format v{}", edgesync_outbox::RECORD_VERSION);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_compact_dry_run() {
        let edge = EdgeId::new();
        let cli = Cli::parse_from([
            "edgesync",
            "--path",
            "/tmp/outbox",
            "compact",
            "--edge",
            &edge.to_string(),
            "--dry-run",
        ]);
        match cli.command {
            Commands::Compact {
                edge: parsed,
                dry_run,
                keep_delivered,
            } => {
                assert_eq!(parsed, edge);
                assert!(dry_run);
                assert!(!keep_delivered);
            }
            _ => panic!("expected compact"),
        }
    }
}
