//! BucketDedup - time-windowed event deduplication from your terminal.
//!
//! A pipe-friendly CLI and HTTP server that drops repeated events while
//! keeping seen keys in a durable store across restarts.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use bucketdedup::output;
use bucketdedup::server::{self, ServerConfig};
use bucketdedup::window::WindowPolicy;
use bucketdedup::{AnyStore, BucketStore, Deduper, JsonEvent, KeySpec, SystemClock};

mod cli;

use cli::{Cli, Command};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Serve(args) => cmd_serve(&args),
        Command::Inspect(args) => cmd_inspect(&args),
    }
}

/// Initialize tracing subscriber.
fn init_tracing(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn key_spec(engine: &cli::EngineArgs) -> Result<Arc<KeySpec>> {
    let spec = KeySpec::new(engine.key_fields.clone(), engine.time_field.clone())
        .context("invalid key fields")?;
    Ok(Arc::new(spec))
}

/// Execute the `run` command - deduplicate an NDJSON stream to stdout.
fn cmd_run(args: &cli::RunArgs) -> Result<()> {
    let spec = key_spec(&args.engine)?;
    let config = args.engine.dedup_config();
    let store = AnyStore::open(&args.store.location());
    let format = args.format;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut deduper = Deduper::setup(
        &config,
        store,
        Arc::new(SystemClock),
        move |event: JsonEvent| output::render(&event, format),
        tx,
    )
    .context("failed to start deduper")?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let window_events = args.window_events.max(1);
    let stdout = io::stdout();
    let mut window = 0u64;
    let mut in_window = 0usize;
    let mut unparsable = 0u64;

    deduper.begin_window(window);
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str(&line) {
            Ok(value) => {
                if let Err(e) = deduper.process(JsonEvent::new(value, Arc::clone(&spec))) {
                    warn!(line = index + 1, "skipping event: {e}");
                }
            }
            Err(e) => {
                unparsable += 1;
                warn!(line = index + 1, "skipping invalid JSON: {e}");
            }
        }

        in_window += 1;
        if in_window == window_events {
            close_window(&mut deduper, &mut rx, &mut stdout.lock(), args.summary)?;
            window += 1;
            in_window = 0;
            deduper.begin_window(window);
        }
    }

    close_window(&mut deduper, &mut rx, &mut stdout.lock(), args.summary)?;
    deduper.teardown();
    drain_output(&mut rx, &mut stdout.lock())?;

    let stats = deduper.stats();
    info!(
        processed = stats.processed,
        emitted = stats.emitted,
        duplicates = stats.duplicates,
        late = stats.late,
        malformed = stats.malformed + unparsable,
        "dedup rate: {:.1}%",
        stats.dupe_rate() * 100.0
    );
    Ok(())
}

/// End the window, run idle maintenance, and write what was emitted.
fn close_window<S: BucketStore, W: Write>(
    deduper: &mut Deduper<JsonEvent, String, S>,
    rx: &mut mpsc::UnboundedReceiver<String>,
    out: &mut W,
    summary: bool,
) -> Result<()> {
    let report = deduper.end_window();
    deduper.handle_idle_time();
    drain_output(rx, out)?;

    if summary {
        output::write_report(&mut io::stderr().lock(), &report)?;
    }
    Ok(())
}

fn drain_output<W: Write>(rx: &mut mpsc::UnboundedReceiver<String>, out: &mut W) -> Result<()> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    output::write_lines(out, &lines)?;
    out.flush()?;
    Ok(())
}

/// Execute the `serve` command - start the HTTP ingestion server.
fn cmd_serve(args: &cli::ServeArgs) -> Result<()> {
    let spec = key_spec(&args.engine)?;
    let dedup_config = args.engine.dedup_config();
    let config = ServerConfig {
        port: args.port,
        host: args.host.clone(),
        window_interval: args.window_interval,
        idle_tick: args.idle_tick,
        ..Default::default()
    };

    let store = AnyStore::open(&args.store.location());
    let (state, worker) =
        server::spawn_worker(&config, &dedup_config, store, Arc::new(SystemClock), spec)
            .context("failed to start dedup worker")?;

    // Run the async server on tokio runtime
    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(server::run_server(&config, state))?;

    // Every sender is gone once the server stops, so the worker flushes and exits
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("dedup worker panicked"))?;
    Ok(())
}

/// Execute the `inspect` command - print the keys stored for one bucket.
fn cmd_inspect(args: &cli::InspectArgs) -> Result<()> {
    let bucket = match (args.bucket, args.at) {
        (Some(bucket), _) => bucket,
        (None, Some(at)) => {
            let config = bucketdedup::DedupConfig {
                bucket_span: args.window.bucket_span,
                bucket_count: args.window.buckets,
                grace_period: args.window.grace,
                ..Default::default()
            };
            config.validate()?;
            WindowPolicy::new(&config).bucket_key_for(at)?
        }
        (None, None) => anyhow::bail!("either --bucket or --at is required"),
    };

    let store = AnyStore::open(&args.store.location());
    let loaded = tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(store.load(bucket))
        .with_context(|| format!("failed to load bucket {bucket}"))?;

    let Some(seen) = loaded else {
        info!(bucket, "bucket has no stored keys");
        return Ok(());
    };

    let mut keys: Vec<_> = seen.into_iter().collect();
    keys.sort_unstable();
    info!(bucket, keys = keys.len(), "bucket loaded");

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for key in &keys {
        writeln!(handle, "{}", serde_json::to_string(key)?)?;
    }
    Ok(())
}
