use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferStats, RecordHandler, SegmentBuffer};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::http::HttpExporter;
use crate::export::log::LogExporter;
use crate::export::Exporter;
use crate::persist::PersistenceTimer;
use crate::pipeline::{Aggregates, SegmentPipeline};

/// How often buffer and pipeline counters are folded into prometheus.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Agent orchestrates all components: segment buffer, pipeline, persistence
/// timer and the collector server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    buffer: Option<SegmentBuffer>,
    pipeline: Option<Arc<SegmentPipeline>>,
    aggregates: Option<Arc<Aggregates>>,
    persistence: Option<PersistenceTimer>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    persist_cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.server.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            buffer: None,
            pipeline: None,
            aggregates: None,
            persistence: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            persist_cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin collecting.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Open the segment buffer. This takes the directory lock, so a
        //    second collector on the same path fails here.
        let buffer_cfg = self.cfg.buffer.clone();
        let buffer = tokio::task::spawn_blocking(move || SegmentBuffer::open(&buffer_cfg))
            .await
            .context("opening segment buffer")?
            .context("opening segment buffer")?;

        let cursor = buffer.offsets().snapshot();
        info!(
            path = %self.cfg.buffer.buffer_path.display(),
            read_file = %cursor.read.file_name,
            read_offset = cursor.read.offset,
            write_file = %cursor.write.file_name,
            write_offset = cursor.write.offset,
            "resuming from buffer cursor",
        );

        // 2. Build the caches and the pipeline that feeds them. The pipeline
        //    refuses records until everything downstream is running.
        let aggregates = Arc::new(Aggregates::new(self.cfg.aggregation.slow_trace_top_n));
        let pipeline = Arc::new(SegmentPipeline::new(
            Arc::clone(&aggregates),
            self.cfg.aggregation.slow_trace_threshold,
        ));

        // 3. Configure exporters and start the persistence timer.
        let mut persistence = PersistenceTimer::new(
            Arc::clone(&aggregates),
            Arc::clone(&self.health),
            self.cfg.aggregation.persist_interval,
            self.cfg.aggregation.rollups,
        );

        if self.cfg.exporter.log.enabled {
            persistence.add_exporter(Exporter::Log(LogExporter::new()));
            info!("log exporter configured");
        }

        if self.cfg.exporter.http.enabled {
            persistence.add_exporter(Exporter::Http(HttpExporter::new(
                self.cfg.exporter.http.clone(),
            )));
            info!(
                address = %self.cfg.exporter.http.address,
                "HTTP exporter configured",
            );
        }

        persistence
            .start(self.persist_cancel.clone())
            .await
            .context("starting persistence timer")?;

        // 4. Start the collector server, with the ingest route when enabled.
        let writer = self.cfg.server.ingest_enabled.then(|| buffer.writer());
        self.health
            .start(writer)
            .await
            .context("starting collector server")?;

        // 5. Start replay and cursor flushing, then open the pipeline.
        let handler: Arc<dyn RecordHandler> = pipeline.clone();
        self.tasks
            .extend(buffer.spawn(handler, self.cancel.child_token()));
        pipeline.set_ready(true);

        // 6. Start background reporters.
        self.tasks.push(self.spawn_stats_reporter(
            buffer.stats(),
            Arc::clone(&pipeline),
        ));

        self.buffer = Some(buffer);
        self.pipeline = Some(pipeline);
        self.aggregates = Some(aggregates);
        self.persistence = Some(persistence);

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop replay first so the final drain sees every replayed record.
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_ready(false);
        }
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task join failed");
            }
        }

        // Final drain and exporter shutdown.
        self.persist_cancel.cancel();
        if let Some(persistence) = &self.persistence {
            persistence.wait_for_shutdown().await;
        }

        // Stop the collector server.
        if let Err(e) = self.health.stop().await {
            error!(error = %e, "error stopping collector server");
        }

        // Releases the buffer directory lock.
        self.buffer.take();

        Ok(())
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Caches fed by the pipeline, once started.
    pub fn aggregates(&self) -> Option<&Arc<Aggregates>> {
        self.aggregates.as_ref()
    }

    /// Folds buffer and pipeline counters into prometheus on a fixed
    /// interval, and once more on shutdown.
    fn spawn_stats_reporter(
        &self,
        stats: Arc<BufferStats>,
        pipeline: Arc<SegmentPipeline>,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.child_token();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report_stats(&health, &stats, &pipeline);
                        return;
                    }
                    _ = ticker.tick() => report_stats(&health, &stats, &pipeline),
                }
            }
        })
    }
}

fn report_stats(health: &HealthMetrics, stats: &BufferStats, pipeline: &SegmentPipeline) {
    let snapshot = stats.snapshot();
    health.observe_buffer(&snapshot);

    let (accepted, parse_errors) = pipeline.take_counts();
    health.segments_accepted.inc_by(accepted as f64);
    health.segment_parse_errors.inc_by(parse_errors as f64);

    if snapshot.records_written == 0 && snapshot.records_replayed == 0 && parse_errors == 0 {
        return;
    }

    info!(
        written = snapshot.records_written,
        replayed = snapshot.records_replayed,
        accepted,
        parse_errors,
        "collector stats",
    );
    debug!(
        bytes_written = snapshot.bytes_written,
        write_errors = snapshot.write_errors,
        paused = snapshot.replay_paused,
        torn = snapshot.torn_records,
        rotated = snapshot.files_rotated,
        deleted = snapshot.files_deleted,
        offset_flushes = snapshot.offset_flushes,
        "buffer stats",
    );
}
