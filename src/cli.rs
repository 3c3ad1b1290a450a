//! Command-line interface definitions.
//!
//! Uses clap derive API for argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use bucketdedup::config::{parse_duration, DedupConfig, RetryConfig, StoreLocation};
use bucketdedup::output::Format;

/// Time-windowed event deduplication with durable seen-key state.
#[derive(Parser, Debug)]
#[command(name = "bucketdedup")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    pub quiet: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deduplicate an NDJSON stream (stdin or file) to stdout
    Run(RunArgs),

    /// Start the HTTP ingestion server
    Serve(ServeArgs),

    /// Print the keys stored for one bucket
    Inspect(InspectArgs),
}

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Memory,
    Fs,
    S3,
}

/// Where seen keys are persisted.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Storage backend
    #[arg(long, value_enum, default_value = "fs")]
    pub store: StoreKind,

    /// Directory for the `fs` backend
    #[arg(long, default_value = "./dedup-state")]
    pub store_root: PathBuf,

    /// S3 bucket for the `s3` backend
    #[arg(long, required_if_eq("store", "s3"))]
    pub s3_bucket: Option<String>,

    /// Object key prefix inside the S3 bucket
    #[arg(long, default_value = "bucketdedup")]
    pub s3_prefix: String,

    /// AWS region (defaults to the environment)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint, e.g. MinIO or LocalStack
    #[arg(long)]
    pub s3_endpoint: Option<String>,
}

impl StoreArgs {
    /// Resolve the configured backend location.
    #[must_use]
    pub fn location(&self) -> StoreLocation {
        match self.store {
            StoreKind::Memory => StoreLocation::Memory,
            StoreKind::Fs => StoreLocation::Fs {
                root: self.store_root.clone(),
            },
            StoreKind::S3 => StoreLocation::S3 {
                bucket: self.s3_bucket.clone().unwrap_or_default(),
                prefix: self.s3_prefix.clone(),
                region: self.s3_region.clone(),
                endpoint: self.s3_endpoint.clone(),
            },
        }
    }
}

/// How the window is shaped.
#[derive(Args, Debug, Clone)]
pub struct WindowArgs {
    /// Duration of one bucket slot
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub bucket_span: Duration,

    /// Number of most recent slots kept live
    #[arg(long, default_value = "60")]
    pub buckets: u64,

    /// Extra time a slot stays matchable after leaving the window
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub grace: Duration,
}

/// Event layout and engine tuning.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Field forming the dedup key; repeat for composite keys (dotted paths allowed)
    #[arg(long = "key-field", short = 'k', required = true)]
    pub key_fields: Vec<String>,

    /// Field holding event time (epoch ms or RFC 3339)
    #[arg(long, default_value = "timestamp")]
    pub time_field: String,

    #[command(flatten)]
    pub window: WindowArgs,

    /// Soft cap on buckets held in memory
    #[arg(long, default_value = "1024")]
    pub max_resident: usize,

    /// Longest an end of window waits for store I/O
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub drain_timeout: Duration,

    /// Worker threads for store I/O
    #[arg(long, default_value = "2")]
    pub loader_threads: usize,

    /// Retries per store call before giving up
    #[arg(long, default_value = "5")]
    pub max_retries: u32,
}

impl EngineArgs {
    #[must_use]
    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            bucket_span: self.window.bucket_span,
            bucket_count: self.window.buckets,
            grace_period: self.window.grace,
            max_resident_buckets: self.max_resident,
            drain_timeout: self.drain_timeout,
            loader_threads: self.loader_threads,
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            },
        }
    }
}

/// Arguments for the `run` command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// NDJSON input file (stdin if omitted)
    #[arg(long, short = 'i')]
    pub input: Option<PathBuf>,

    /// Events per processing window
    #[arg(long, default_value = "1000")]
    pub window_events: usize,

    /// Output format
    #[arg(long, short = 'f', default_value = "ndjson", value_parser = parse_format)]
    pub format: Format,

    /// Print a summary line per window to stderr
    #[arg(long)]
    pub summary: bool,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for the `serve` command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, short = 'p', default_value = "8080")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Length of one processing window
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub window_interval: Duration,

    /// Quiet time after which idle maintenance runs
    #[arg(long, default_value = "250ms", value_parser = parse_duration)]
    pub idle_tick: Duration,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for the `inspect` command.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Bucket key to print
    #[arg(long, conflicts_with = "at", required_unless_present = "at")]
    pub bucket: Option<u64>,

    /// Event time (epoch ms) whose bucket to print
    #[arg(long)]
    pub at: Option<i64>,

    #[command(flatten)]
    pub window: WindowArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Parse an output format from string.
fn parse_format(s: &str) -> Result<Format, String> {
    s.parse()
}
