use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Batch;

/// Writes persisted batches to the tracing log.
///
/// Summaries go to `info`; slow traces are itemised at `debug`.
#[derive(Debug, Default)]
pub struct LogExporter;

impl LogExporter {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "log"
    }

    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        info!("log exporter started");
        Ok(())
    }

    pub async fn export(&self, batch: &Batch) -> Result<()> {
        match batch {
            Batch::EndpointMetrics { downsampling, rows } => {
                let calls: u64 = rows.iter().map(|r| r.calls).sum();
                let errors: u64 = rows.iter().map(|r| r.errors).sum();
                info!(
                    kind = batch.kind(),
                    downsampling = %downsampling,
                    rows = rows.len(),
                    calls,
                    errors,
                    "persisted endpoint metrics",
                );
            }
            Batch::SlowTraces(rows) => {
                info!(kind = batch.kind(), rows = rows.len(), "persisted slow traces");
                for trace in rows {
                    debug!(
                        service = %trace.service,
                        endpoint = %trace.endpoint,
                        trace_id = %trace.trace_id,
                        duration_ms = trace.duration_ms,
                        "slow trace",
                    );
                }
            }
            Batch::Segments(rows) => {
                info!(kind = batch.kind(), rows = rows.len(), "persisted segments");
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
