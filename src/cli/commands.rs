//! CLI commands

use crate::core::event::EventIdentifier;
use crate::core::temporal::Timestamp;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Timeline-Store CLI
#[derive(Parser)]
#[command(name = "timeline-store")]
#[command(about = "Segmented event storage with chronological merge")]
pub struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store directory
    #[arg(long, global = true, default_value = "timeline-store")]
    pub store: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Decode one input into one segment and print a completion report
    Worker {
        #[arg(long)]
        task_id: u64,
        /// JSON-lines input file
        #[arg(long)]
        input: String,
        /// Segment file to write
        #[arg(long)]
        segment: PathBuf,
    },
    /// Start a session with one worker process per input
    Run {
        /// JSON-lines input files
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Per-task deadline in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Run tasks on threads of this process instead of worker processes
        #[arg(long)]
        in_process: bool,
    },
    /// Merge sessions into one timeline (JSON lines)
    Merge {
        /// Sessions to merge (default: the most recent)
        #[arg(short, long)]
        session: Vec<Uuid>,
        /// Merge every session in the store
        #[arg(long, conflicts_with = "session")]
        all: bool,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Earliest timestamp (RFC 3339 or microseconds)
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<Timestamp>,
        /// Latest timestamp (RFC 3339 or microseconds)
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<Timestamp>,
        /// Only these data types
        #[arg(long = "data-type")]
        data_types: Vec<String>,
        /// Attribute for --contains
        #[arg(long, requires = "contains")]
        attribute: Option<String>,
        /// Text the attribute must contain (case-insensitive)
        #[arg(long, requires = "attribute")]
        contains: Option<String>,
        /// Keep duplicate events
        #[arg(long)]
        no_dedup: bool,
    },
    /// Label an event
    Tag {
        /// Event identifier, `<segment>:<sequence>`
        event: EventIdentifier,
        /// Labels to add
        #[arg(short, long = "label", required = true)]
        labels: Vec<String>,
        /// Replace the comment
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Describe a segment file, or list sessions when none is given
    Inspect {
        segment: Option<PathBuf>,
    },
}

/// Accepts RFC 3339 or integer microseconds since the epoch
pub fn parse_timestamp(value: &str) -> Result<Timestamp, String> {
    if let Ok(micros) = value.parse::<i64>() {
        return Ok(Timestamp::from_micros(micros));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| Timestamp::from_micros(dt.timestamp_micros()))
        .map_err(|e| format!("expected RFC 3339 or microseconds: {}", e))
}
