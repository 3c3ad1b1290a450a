//! HTTP ingestion server.
//!
//! Provides a deduplicating event endpoint using:
//! - Axum for HTTP server
//! - A dedicated worker thread that owns the [`Deduper`]
//! - SSE (Server-Sent Events) to stream novel events
//!
//! Handlers only validate and forward. The worker runs windows on a fixed
//! cadence and the idle hook whenever no event arrives for a tick.

use std::convert::Infallible;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DedupConfig;
use crate::dedup::{DedupStats, Deduper};
use crate::errors::DedupError;
use crate::manager::ManagerStats;
use crate::models::{DedupEvent, JsonEvent, KeySpec};
use crate::store::BucketStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Length of one processing window
    pub window_interval: Duration,
    /// Quiet time after which the idle hook runs
    pub idle_tick: Duration,
    /// SSE buffer; slow subscribers skip what they miss
    pub stream_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            window_interval: Duration::from_secs(1),
            idle_tick: Duration::from_millis(250),
            stream_capacity: 1024,
        }
    }
}

/// Counters published by the worker after every window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServerStats {
    pub windows: u64,
    pub dedup: DedupStats,
    pub dupe_rate: f64,
    pub buckets: ManagerStats,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Ingestion queue of the dedup worker
    events: std_mpsc::Sender<JsonEvent>,
    /// Novel events as NDJSON lines, for SSE clients
    output: broadcast::Sender<String>,
    stats: watch::Receiver<ServerStats>,
    key_spec: Arc<KeySpec>,
}

/// Start the dedup worker thread.
///
/// Returns once the deduper is set up. The worker runs until every clone of
/// the returned state is dropped, then flushes and tears down.
///
/// # Errors
///
/// Returns the setup error if the deduper could not be built.
pub fn spawn_worker<S: BucketStore>(
    config: &ServerConfig,
    dedup_config: &DedupConfig,
    store: S,
    clock: Arc<dyn Clock>,
    key_spec: Arc<KeySpec>,
) -> Result<(AppState, JoinHandle<()>), DedupError> {
    let (events_tx, events_rx) = std_mpsc::channel::<JsonEvent>();
    let (output, _) = broadcast::channel::<String>(config.stream_capacity.max(1));
    let (stats_tx, stats_rx) = watch::channel(ServerStats::default());
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), DedupError>>(1);

    let worker_output = output.clone();
    let dedup_config = dedup_config.clone();
    let window_interval = config.window_interval;
    let idle_tick = config.idle_tick;

    let handle = thread::Builder::new()
        .name("dedup-worker".into())
        .spawn(move || {
            let deduper = Deduper::setup(
                &dedup_config,
                store,
                clock,
                |event: JsonEvent| event.value().to_string(),
                worker_output,
            );
            match deduper {
                Ok(mut deduper) => {
                    let _ = ready_tx.send(Ok(()));
                    run_worker(&mut deduper, &events_rx, &stats_tx, window_interval, idle_tick);
                    deduper.teardown();
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(DedupError::Runtime(std::io::Error::other(
                "dedup worker exited during setup",
            )));
        }
    }

    let state = AppState {
        events: events_tx,
        output,
        stats: stats_rx,
        key_spec,
    };
    Ok((state, handle))
}

/// Window loop of the dedup worker. Returns when the ingestion queue closes.
fn run_worker<S: BucketStore>(
    deduper: &mut Deduper<JsonEvent, String, S>,
    events: &std_mpsc::Receiver<JsonEvent>,
    stats: &watch::Sender<ServerStats>,
    window_interval: Duration,
    idle_tick: Duration,
) {
    let mut window = 0u64;

    loop {
        deduper.begin_window(window);
        let deadline = Instant::now() + window_interval;
        let mut open = true;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match events.recv_timeout(remaining.min(idle_tick)) {
                Ok(event) => {
                    if let Err(e) = deduper.process(event) {
                        debug!(window, "dropping event: {e}");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    deduper.handle_idle_time();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    open = false;
                    break;
                }
            }
        }

        let report = deduper.end_window();
        // The gap between windows counts as idle time
        deduper.handle_idle_time();

        let dedup = deduper.stats();
        stats.send_replace(ServerStats {
            windows: window + 1,
            dedup,
            dupe_rate: dedup.dupe_rate(),
            buckets: report.buckets,
        });

        if !open {
            info!(windows = window + 1, "ingestion closed, stopping dedup worker");
            return;
        }
        window += 1;
    }
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(events_handler))
        .route("/stream", get(sse_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run_server(config: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("bucketdedup listening at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Ingest one event object or an array of them.
///
/// The batch is rejected as a whole if any event lacks a usable key or time.
async fn events_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let values = match body {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut batch = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let event = JsonEvent::new(value, Arc::clone(&state.key_spec));
        if let Err(e) = event.dedup_key().and_then(|_| event.timestamp_ms()) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string(), "index": index })),
            )
                .into_response();
        }
        batch.push(event);
    }

    let accepted = batch.len();
    for event in batch {
        if state.events.send(event).is_err() {
            warn!("dedup worker is gone, rejecting events");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "dedup worker stopped" })),
            )
                .into_response();
        }
    }

    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}

/// SSE stream handler for novel events.
async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.output.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(line) => Some(Ok(Event::default().event("event").data(line))),
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Counters as of the last finished window.
async fn stats_handler(State(state): State<AppState>) -> Json<ServerStats> {
    Json(*state.stats.borrow())
}

/// Health check endpoint.
async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryBucketStore;

    fn fast() -> ServerConfig {
        ServerConfig {
            window_interval: Duration::from_millis(50),
            idle_tick: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn state() -> (AppState, JoinHandle<()>) {
        let spec = Arc::new(KeySpec::new(vec!["id".into()], "ts").unwrap());
        spawn_worker(
            &fast(),
            &DedupConfig::default(),
            MemoryBucketStore::new(),
            Arc::new(ManualClock::new(0)),
            spec,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_batch_is_rejected() {
        let (state, _worker) = state();
        let body = json!([{"id": "a", "ts": 1}, {"ts": 2}]);
        let response = events_handler(State(state), Json(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicates_reach_the_stream_once() {
        let (state, _worker) = state();
        let mut rx = state.output.subscribe();

        let body = json!([{"id": "a", "ts": 1}, {"id": "a", "ts": 2}, {"id": "b", "ts": 3}]);
        let response = events_handler(State(state.clone()), Json(body)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut lines = Vec::new();
        for _ in 0..2 {
            let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            lines.push(serde_json::from_str::<Value>(&line).unwrap()["id"].clone());
        }
        assert_eq!(lines, vec![json!("a"), json!("b")]);

        // Both windows around the batch have closed once stats show it
        let mut stats = state.stats.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            stats.wait_for(|s| s.dedup.duplicates == 1),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health_handler().await, "OK");
    }
}
