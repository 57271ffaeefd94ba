//! Periodic persistence of the aggregation caches.
//!
//! Each pass switches every window, hands the switched-out generation to the
//! exporters and then releases it. Minute endpoint metrics are forwarded into
//! the hour window before the hour window is drained, so one pass carries a
//! row through the whole rollup chain. Rollup rows are partial aggregates
//! keyed by bucket; the backend merges rows with equal keys.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Collection, Window};
use crate::export::health::HealthMetrics;
use crate::export::{Batch, Exporter};
use crate::pipeline::{Aggregates, Downsampling, MetricWindow};

/// Rows exported and windows skipped by one persistence pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub rows: usize,
    pub skipped: usize,
}

/// Drains [`Aggregates`] into a set of started exporters.
pub struct Persister {
    aggregates: Arc<Aggregates>,
    exporters: Vec<Exporter>,
    health: Arc<HealthMetrics>,
    rollups: bool,
}

impl Persister {
    pub fn new(
        aggregates: Arc<Aggregates>,
        exporters: Vec<Exporter>,
        health: Arc<HealthMetrics>,
        rollups: bool,
    ) -> Self {
        Self {
            aggregates,
            exporters,
            health,
            rollups,
        }
    }

    /// Runs one persistence pass over every cache.
    pub async fn persist_once(&self) -> PersistReport {
        let started = Instant::now();
        let mut report = PersistReport::default();
        let aggregates = Arc::clone(&self.aggregates);

        self.persist_metrics(Downsampling::Minute, &aggregates.endpoints, &mut report)
            .await;

        if self.rollups {
            let levels: Vec<_> = aggregates.rollups.levels().collect();
            for (downsampling, window) in levels {
                self.persist_metrics(downsampling, window, &mut report)
                    .await;
            }
        }

        match self.switch_and_copy("slow_trace", &aggregates.slow_traces) {
            Some(rows) => {
                report.rows += self.export(&Batch::SlowTraces(rows)).await;
                aggregates.slow_traces.finish_reading_last();
            }
            None => report.skipped += 1,
        }

        let segments = aggregates.segments.read();
        report.rows += self.export(&Batch::Segments(segments)).await;

        self.health
            .persist_duration
            .observe(started.elapsed().as_secs_f64());

        report
    }

    async fn persist_metrics(
        &self,
        downsampling: Downsampling,
        window: &MetricWindow,
        report: &mut PersistReport,
    ) {
        let label = format!("endpoint_{downsampling}");
        let Some(rows) = self.switch_and_copy(&label, window) else {
            report.skipped += 1;
            return;
        };

        let batch = Batch::EndpointMetrics { downsampling, rows };
        report.rows += self.export(&batch).await;
        window.finish_reading_last();

        if self.rollups {
            if let Batch::EndpointMetrics { rows, .. } = &batch {
                let forwarded = self.aggregates.rollups.forward(downsampling, rows);
                if forwarded > 0 {
                    debug!(from = %downsampling, forwarded, "forwarded endpoint metrics");
                }
            }
        }
    }

    /// Switches `window` and copies the generation that was switched out.
    ///
    /// The copy stays marked as being read until the caller invokes
    /// `finish_reading_last`, so a concurrent switch attempt is refused.
    fn switch_and_copy<C>(&self, label: &str, window: &Window<C>) -> Option<Vec<C::Item>>
    where
        C: Collection,
        C::Item: Clone,
    {
        let Some(claim) = window.try_switch_pointer() else {
            self.health
                .window_switches_skipped
                .with_label_values(&[label])
                .inc();
            warn!(window = label, "previous generation still being read, skipping");
            return None;
        };
        claim.switch_pointer();
        drop(claim);

        self.health
            .window_switches
            .with_label_values(&[label])
            .inc();

        let rows = window.last().collection().into_iter().cloned().collect();
        Some(rows)
    }

    /// Hands `batch` to every exporter. Returns the row count when at least
    /// one exporter took the batch, or when none is configured; a batch
    /// every exporter failed on counts as not persisted.
    async fn export(&self, batch: &Batch) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut delivered = self.exporters.is_empty();
        for exporter in &self.exporters {
            match exporter.export(batch).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    self.health
                        .export_errors
                        .with_label_values(&[exporter.name(), batch.kind()])
                        .inc();
                    error!(
                        exporter = exporter.name(),
                        kind = batch.kind(),
                        rows = batch.len(),
                        error = %e,
                        "export failed",
                    );
                }
            }
        }

        if !delivered {
            return 0;
        }

        self.health
            .rows_persisted
            .with_label_values(&[batch.kind()])
            .inc_by(batch.len() as f64);

        batch.len()
    }

    /// Persists whatever is left in both generations of every cache.
    pub async fn final_drain(&self) -> PersistReport {
        let mut total = PersistReport::default();
        // The second pass picks up rows written while the first ran.
        for _ in 0..2 {
            let report = self.persist_once().await;
            total.rows += report.rows;
            total.skipped += report.skipped;
        }
        total
    }

    async fn stop_exporters(&mut self) {
        for exporter in &mut self.exporters {
            if let Err(e) = exporter.stop().await {
                error!(
                    exporter = exporter.name(),
                    error = %e,
                    "exporter stop failed",
                );
            }
        }
    }
}

/// Runs [`Persister::persist_once`] on a fixed interval.
pub struct PersistenceTimer {
    aggregates: Arc<Aggregates>,
    health: Arc<HealthMetrics>,
    exporters: Vec<Exporter>,
    interval: Duration,
    rollups: bool,
    run_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceTimer {
    pub fn new(
        aggregates: Arc<Aggregates>,
        health: Arc<HealthMetrics>,
        interval: Duration,
        rollups: bool,
    ) -> Self {
        Self {
            aggregates,
            health,
            exporters: Vec::with_capacity(2),
            interval,
            rollups,
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Registers an exporter. Must be called before [`PersistenceTimer::start`].
    pub fn add_exporter(&mut self, exporter: Exporter) {
        self.exporters.push(exporter);
    }

    /// Starts the exporters and spawns the persistence loop.
    ///
    /// When `ctx` is cancelled the loop runs a final drain, stops the
    /// exporters and exits.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let mut exporters = std::mem::take(&mut self.exporters);
        for exporter in &mut exporters {
            exporter.start(ctx.clone()).await?;
            info!(exporter = exporter.name(), "exporter started");
        }

        let mut persister = Persister::new(
            Arc::clone(&self.aggregates),
            exporters,
            Arc::clone(&self.health),
            self.rollups,
        );
        let interval = self.interval;

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let report = persister.final_drain().await;
                        info!(rows = report.rows, "final persistence drain");
                        persister.stop_exporters().await;
                        return;
                    }

                    _ = ticker.tick() => {
                        let report = persister.persist_once().await;
                        debug!(
                            rows = report.rows,
                            skipped = report.skipped,
                            "persistence pass finished",
                        );
                    }
                }
            }
        });

        *self.run_task.lock().await = Some(run_task);

        info!(interval = ?self.interval, "persistence timer started");

        Ok(())
    }

    /// Waits for the persistence loop to finish its final drain.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "persistence task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RecordHandler;
    use crate::config::HttpExportConfig;
    use crate::export::http::HttpExporter;
    use crate::export::log::LogExporter;
    use crate::pipeline::SegmentPipeline;
    use crate::segment::tests::segment_json;

    fn fixture() -> (Arc<Aggregates>, SegmentPipeline, Arc<HealthMetrics>) {
        let aggregates = Arc::new(Aggregates::new(10));
        let pipeline = SegmentPipeline::new(Arc::clone(&aggregates), Duration::from_millis(500));
        pipeline.set_ready(true);
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        (aggregates, pipeline, health)
    }

    fn persisted(health: &HealthMetrics, kind: &str) -> f64 {
        health.rows_persisted.with_label_values(&[kind]).get()
    }

    #[tokio::test]
    async fn test_persist_once_drains_every_cache() {
        let (aggregates, pipeline, health) = fixture();
        assert!(pipeline.handle(&segment_json("svc", "/a", 1_704_207_845_678, 900)));
        assert!(pipeline.handle(&segment_json("svc", "/a", 1_704_207_845_679, 10)));

        let persister = Persister::new(
            Arc::clone(&aggregates),
            vec![Exporter::Log(LogExporter::new())],
            Arc::clone(&health),
            true,
        );
        let report = persister.persist_once().await;

        // One minute row plus one row per rollup level.
        assert_eq!(persisted(&health, "endpoint_metric"), 4.0);
        assert_eq!(persisted(&health, "slow_trace"), 1.0);
        assert_eq!(persisted(&health, "segment"), 2.0);
        assert_eq!(report, PersistReport { rows: 7, skipped: 0 });

        let again = persister.persist_once().await;
        assert_eq!(again.rows, 0);
        assert_eq!(aggregates.endpoints.current_size(), 0);
    }

    #[tokio::test]
    async fn test_rollups_disabled_persists_minutes_only() {
        let (aggregates, pipeline, health) = fixture();
        assert!(pipeline.handle(&segment_json("svc", "/a", 0, 10)));

        let persister = Persister::new(aggregates, Vec::new(), Arc::clone(&health), false);
        let report = persister.persist_once().await;

        assert_eq!(report.rows, 2);
        assert_eq!(persisted(&health, "endpoint_metric"), 1.0);
    }

    #[tokio::test]
    async fn test_skips_window_still_being_read() {
        let (aggregates, pipeline, health) = fixture();
        assert!(pipeline.handle(&segment_json("svc", "/a", 0, 10)));

        aggregates
            .endpoints
            .try_switch_pointer()
            .expect("switch")
            .switch_pointer();

        let persister =
            Persister::new(Arc::clone(&aggregates), Vec::new(), Arc::clone(&health), false);
        let report = persister.persist_once().await;

        assert_eq!(report.skipped, 1);
        assert_eq!(
            health
                .window_switches_skipped
                .with_label_values(&["endpoint_minute"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_failed_export_is_not_counted_as_persisted() {
        let (aggregates, pipeline, health) = fixture();
        assert!(pipeline.handle(&segment_json("svc", "/a", 0, 10)));

        let mut http = Exporter::Http(HttpExporter::new(HttpExportConfig {
            enabled: true,
            // Nothing listens on the discard port.
            address: "http://127.0.0.1:9/ingest".to_string(),
            compression: "none".to_string(),
            export_timeout: Duration::from_secs(2),
            ..Default::default()
        }));
        http.start(CancellationToken::new()).await.expect("start");

        let persister = Persister::new(aggregates, vec![http], Arc::clone(&health), false);
        let report = persister.persist_once().await;

        assert_eq!(report.rows, 0);
        assert_eq!(persisted(&health, "segment"), 0.0);
        assert_eq!(persisted(&health, "endpoint_metric"), 0.0);
        assert_eq!(
            health
                .export_errors
                .with_label_values(&["http", "segment"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_one_healthy_exporter_counts_rows() {
        let (aggregates, pipeline, health) = fixture();
        assert!(pipeline.handle(&segment_json("svc", "/a", 0, 10)));

        let mut http = Exporter::Http(HttpExporter::new(HttpExportConfig {
            enabled: true,
            address: "http://127.0.0.1:9/ingest".to_string(),
            compression: "none".to_string(),
            export_timeout: Duration::from_secs(2),
            ..Default::default()
        }));
        http.start(CancellationToken::new()).await.expect("start");

        let persister = Persister::new(
            aggregates,
            vec![http, Exporter::Log(LogExporter::new())],
            Arc::clone(&health),
            false,
        );
        let report = persister.persist_once().await;

        assert_eq!(report.rows, 2);
        assert_eq!(persisted(&health, "segment"), 1.0);
    }

    #[tokio::test]
    async fn test_timer_runs_final_drain_on_cancel() {
        let (aggregates, pipeline, health) = fixture();
        let mut timer = PersistenceTimer::new(
            Arc::clone(&aggregates),
            Arc::clone(&health),
            Duration::from_secs(3600),
            true,
        );
        timer.add_exporter(Exporter::Log(LogExporter::new()));

        let cancel = CancellationToken::new();
        timer.start(cancel.clone()).await.expect("start");

        assert!(pipeline.handle(&segment_json("svc", "/a", 0, 10)));
        cancel.cancel();
        timer.wait_for_shutdown().await;

        assert_eq!(persisted(&health, "segment"), 1.0);
        assert_eq!(persisted(&health, "endpoint_metric"), 4.0);
    }
}
