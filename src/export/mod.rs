pub mod health;
pub mod http;
pub mod log;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Downsampling, EndpointMetric, SegmentRecord, SlowTrace};

use self::http::HttpExporter;
use self::log::LogExporter;

/// Rows drained from one cache in one persistence pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    EndpointMetrics {
        downsampling: Downsampling,
        rows: Vec<EndpointMetric>,
    },
    SlowTraces(Vec<SlowTrace>),
    Segments(Vec<SegmentRecord>),
}

/// One NDJSON line: the row's fields plus its kind.
#[derive(Serialize)]
struct Line<'a, T: Serialize> {
    kind: &'static str,
    #[serde(flatten)]
    row: &'a T,
}

impl Batch {
    /// Label used in logs, metrics and exported rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EndpointMetrics { .. } => "endpoint_metric",
            Self::SlowTraces(_) => "slow_trace",
            Self::Segments(_) => "segment",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::EndpointMetrics { rows, .. } => rows.len(),
            Self::SlowTraces(rows) => rows.len(),
            Self::Segments(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the rows as NDJSON bodies of at most `chunk_size` lines.
    pub fn to_ndjson_chunks(&self, chunk_size: usize) -> serde_json::Result<Vec<Vec<u8>>> {
        let kind = self.kind();
        match self {
            Self::EndpointMetrics { rows, .. } => ndjson_chunks(kind, rows, chunk_size),
            Self::SlowTraces(rows) => ndjson_chunks(kind, rows, chunk_size),
            Self::Segments(rows) => ndjson_chunks(kind, rows, chunk_size),
        }
    }
}

fn ndjson_chunks<T: Serialize>(
    kind: &'static str,
    rows: &[T],
    chunk_size: usize,
) -> serde_json::Result<Vec<Vec<u8>>> {
    rows.chunks(chunk_size.max(1))
        .map(|chunk| {
            let mut buf = Vec::with_capacity(chunk.len() * 256);
            for row in chunk {
                serde_json::to_writer(&mut buf, &Line { kind, row })?;
                buf.push(b'\n');
            }
            Ok(buf)
        })
        .collect()
}

/// Exporter dispatches persisted batches to the log or an HTTP backend.
///
/// Uses enum dispatch rather than trait objects for async calls.
pub enum Exporter {
    Log(LogExporter),
    Http(HttpExporter),
}

impl Exporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Log(e) => e.name(),
            Self::Http(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        match self {
            Self::Log(e) => e.start(ctx).await,
            Self::Http(e) => e.start(ctx).await,
        }
    }

    /// Export one batch.
    pub async fn export(&self, batch: &Batch) -> Result<()> {
        match self {
            Self::Log(e) => e.export(batch).await,
            Self::Http(e) => e.export(batch).await,
        }
    }

    /// Shut down the exporter.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Log(e) => e.stop().await,
            Self::Http(e) => e.stop().await,
        }
    }
}
