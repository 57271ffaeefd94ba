use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferStatsSnapshot, SegmentWriter};

const NAMESPACE: &str = "collectoor";

/// Prometheus metrics for collector health and observability.
///
/// All metrics use the "collectoor" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    // === Buffer ===
    /// Records appended to the segment buffer.
    pub records_written: Counter,
    /// Bytes appended to the segment buffer, framing included.
    pub bytes_written: Counter,
    /// Appends that failed.
    pub write_errors: Counter,
    /// Records handed to the pipeline by the reader.
    pub records_replayed: Counter,
    /// Reader ticks stopped by a refused record.
    pub replay_paused: Counter,
    /// Unreadable file tails skipped by the reader.
    pub torn_records: Counter,
    /// Data file rotations.
    pub files_rotated: Counter,
    /// Data files deleted after replay.
    pub files_deleted: Counter,
    /// Cursor lines written to the offset file.
    pub offset_flushes: Counter,

    // === Pipeline ===
    /// Segments parsed and aggregated.
    pub segments_accepted: Counter,
    /// Records dropped as undecodable.
    pub segment_parse_errors: Counter,

    // === Persistence ===
    /// Window switches by window.
    pub window_switches: CounterVec,
    /// Persistence passes that could not switch a window, by window.
    pub window_switches_skipped: CounterVec,
    /// Rows handed to exporters by kind.
    pub rows_persisted: CounterVec,
    /// Failed exports by exporter and kind.
    pub export_errors: CounterVec,
    /// Duration of one persistence pass.
    pub persist_duration: Histogram,

    // === Ingest ===
    /// Ingest requests by response status.
    pub ingest_requests: CounterVec,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(
        Opts::new(name, help).namespace(NAMESPACE),
    )?)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_written = counter(
            "buffer_records_written_total",
            "Total records appended to the segment buffer.",
        )?;
        let bytes_written = counter(
            "buffer_bytes_written_total",
            "Total bytes appended to the segment buffer.",
        )?;
        let write_errors = counter(
            "buffer_write_errors_total",
            "Total failed appends to the segment buffer.",
        )?;
        let records_replayed = counter(
            "buffer_records_replayed_total",
            "Total records replayed from the segment buffer.",
        )?;
        let replay_paused = counter(
            "buffer_replay_paused_total",
            "Total reader ticks stopped by a refused record.",
        )?;
        let torn_records = counter(
            "buffer_torn_records_total",
            "Total unreadable segment file tails skipped.",
        )?;
        let files_rotated = counter(
            "buffer_files_rotated_total",
            "Total segment file rotations.",
        )?;
        let files_deleted = counter(
            "buffer_files_deleted_total",
            "Total segment files deleted after replay.",
        )?;
        let offset_flushes = counter(
            "buffer_offset_flushes_total",
            "Total cursor lines written to the offset file.",
        )?;

        let segments_accepted = counter(
            "segments_accepted_total",
            "Total segments parsed and aggregated.",
        )?;
        let segment_parse_errors = counter(
            "segment_parse_errors_total",
            "Total records dropped as undecodable.",
        )?;

        let window_switches = counter_vec(
            "window_switches_total",
            "Total window switches by window.",
            &["window"],
        )?;
        let window_switches_skipped = counter_vec(
            "window_switches_skipped_total",
            "Total persistence passes that could not switch a window.",
            &["window"],
        )?;
        let rows_persisted = counter_vec(
            "rows_persisted_total",
            "Total rows handed to exporters by kind.",
            &["kind"],
        )?;
        let export_errors = counter_vec(
            "export_errors_total",
            "Total failed exports by exporter and kind.",
            &["exporter", "kind"],
        )?;
        let persist_duration = Histogram::with_opts(
            HistogramOpts::new(
                "persist_duration_seconds",
                "Duration of one persistence pass in seconds.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let ingest_requests = counter_vec(
            "ingest_requests_total",
            "Total segment ingest requests by status.",
            &["status"],
        )?;

        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(write_errors.clone()))?;
        registry.register(Box::new(records_replayed.clone()))?;
        registry.register(Box::new(replay_paused.clone()))?;
        registry.register(Box::new(torn_records.clone()))?;
        registry.register(Box::new(files_rotated.clone()))?;
        registry.register(Box::new(files_deleted.clone()))?;
        registry.register(Box::new(offset_flushes.clone()))?;
        registry.register(Box::new(segments_accepted.clone()))?;
        registry.register(Box::new(segment_parse_errors.clone()))?;
        registry.register(Box::new(window_switches.clone()))?;
        registry.register(Box::new(window_switches_skipped.clone()))?;
        registry.register(Box::new(rows_persisted.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(persist_duration.clone()))?;
        registry.register(Box::new(ingest_requests.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            records_written,
            bytes_written,
            write_errors,
            records_replayed,
            replay_paused,
            torn_records,
            files_rotated,
            files_deleted,
            offset_flushes,
            segments_accepted,
            segment_parse_errors,
            window_switches,
            window_switches_skipped,
            rows_persisted,
            export_errors,
            persist_duration,
            ingest_requests,
        })
    }

    /// Adds one buffer stats snapshot to the counters.
    pub fn observe_buffer(&self, snap: &BufferStatsSnapshot) {
        self.records_written.inc_by(snap.records_written as f64);
        self.bytes_written.inc_by(snap.bytes_written as f64);
        self.write_errors.inc_by(snap.write_errors as f64);
        self.records_replayed.inc_by(snap.records_replayed as f64);
        self.replay_paused.inc_by(snap.replay_paused as f64);
        self.torn_records.inc_by(snap.torn_records as f64);
        self.files_rotated.inc_by(snap.files_rotated as f64);
        self.files_deleted.inc_by(snap.files_deleted as f64);
        self.offset_flushes.inc_by(snap.offset_flushes as f64);
    }

    /// Starts the HTTP server serving /metrics, /healthz and, when a writer
    /// is given, POST /v1/segments.
    pub async fn start(&self, writer: Option<Arc<SegmentWriter>>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let ingest = writer.is_some();
        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            writer,
            ingest_requests: self.ingest_requests.clone(),
        });

        let mut app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler));

        if ingest {
            app = app.route("/v1/segments", post(ingest_handler));
        }

        let app = app.with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, ingest, "collector server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "collector server error");
            }
        });

        Ok(())
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    writer: Option<Arc<SegmentWriter>>,
    ingest_requests: CounterVec,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// POST /v1/segments - Append one raw segment record to the buffer.
async fn ingest_handler(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let status = ingest(&state, body).await;
    state
        .ingest_requests
        .with_label_values(&[status.as_str()])
        .inc();
    status
}

async fn ingest(state: &AppState, body: Bytes) -> StatusCode {
    let Some(writer) = state.writer.clone() else {
        return StatusCode::NOT_FOUND;
    };

    if body.is_empty() {
        return StatusCode::BAD_REQUEST;
    }

    match tokio::task::spawn_blocking(move || writer.write_record(&body)).await {
        Ok(Ok(())) => StatusCode::ACCEPTED,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "buffering segment failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            tracing::error!(error = %e, "buffering task panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SegmentBuffer;
    use crate::config::BufferConfig;

    #[test]
    fn test_observe_buffer_adds_snapshot() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.observe_buffer(&BufferStatsSnapshot {
            records_written: 3,
            bytes_written: 42,
            ..Default::default()
        });
        health.observe_buffer(&BufferStatsSnapshot {
            records_written: 2,
            ..Default::default()
        });

        assert_eq!(health.records_written.get(), 5.0);
        assert_eq!(health.bytes_written.get(), 42.0);
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_ingest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = SegmentBuffer::open(&BufferConfig {
            buffer_path: dir.path().to_path_buf(),
            ..Default::default()
        })
        .expect("buffer");

        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start(Some(buffer.writer())).await.expect("start");
        let addr = health.local_addr().expect("bound");
        let client = reqwest::Client::new();

        let healthz = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz");
        assert_eq!(healthz.status(), reqwest::StatusCode::OK);

        let accepted = client
            .post(format!("http://{addr}/v1/segments"))
            .body("{\"segment\":1}")
            .send()
            .await
            .expect("ingest");
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);
        assert!(buffer.offsets().write_position().offset > 0);

        let empty = client
            .post(format!("http://{addr}/v1/segments"))
            .send()
            .await
            .expect("ingest empty");
        assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains("collectoor_ingest_requests_total"));

        health.stop().await.expect("stop");
    }
}
