//! Turns replayed segment records into aggregates.

pub mod bucket;
pub mod metric;
pub mod rollup;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::RecordHandler;
use crate::cache::{
    AppendBufferedData, MergeCollection, ReadWriteSafeCache, TopNCollection, Window,
};
use crate::segment;

pub use bucket::Downsampling;
pub use metric::{EndpointKey, EndpointMetric, SegmentRecord, SlowTrace};
pub use rollup::{MetricWindow, RollupChain};

/// Every cache the pipeline writes to and the persistence timer drains.
pub struct Aggregates {
    /// Minute endpoint metrics, merged by key.
    pub endpoints: MetricWindow,
    /// Slowest segments per service.
    pub slow_traces: Window<TopNCollection<SlowTrace>>,
    /// One row per received segment.
    pub segments: ReadWriteSafeCache<AppendBufferedData<SegmentRecord>>,
    /// Hour, day and month endpoint metrics.
    pub rollups: RollupChain,
}

impl Aggregates {
    pub fn new(slow_trace_top_n: usize) -> Self {
        Self {
            endpoints: Window::new(MergeCollection::new),
            slow_traces: Window::new(|| {
                TopNCollection::new(slow_trace_top_n, SlowTrace::by_duration)
            }),
            segments: ReadWriteSafeCache::default(),
            rollups: RollupChain::new(),
        }
    }
}

/// Record handler feeding parsed segments into [`Aggregates`].
///
/// Refuses records until marked ready, which keeps them in the buffer while
/// downstream components are still starting. Undecodable records are logged
/// and acknowledged so one bad record cannot stall replay.
pub struct SegmentPipeline {
    aggregates: Arc<Aggregates>,
    slow_trace_threshold_ms: i64,
    ready: AtomicBool,
    accepted: AtomicU64,
    parse_errors: AtomicU64,
}

impl SegmentPipeline {
    pub fn new(aggregates: Arc<Aggregates>, slow_trace_threshold: Duration) -> Self {
        Self {
            aggregates,
            slow_trace_threshold_ms: i64::try_from(slow_trace_threshold.as_millis())
                .unwrap_or(i64::MAX),
            ready: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Reads and resets the (accepted, parse error) counters.
    pub fn take_counts(&self) -> (u64, u64) {
        (
            self.accepted.swap(0, Ordering::Relaxed),
            self.parse_errors.swap(0, Ordering::Relaxed),
        )
    }
}

impl RecordHandler for SegmentPipeline {
    fn handle(&self, record: &[u8]) -> bool {
        if !self.is_ready() {
            return false;
        }

        let segment = match segment::parse(record) {
            Ok(segment) => segment,
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = record.len(), "dropping undecodable segment");
                return true;
            }
        };

        if let Some(metric) = EndpointMetric::from_segment(&segment) {
            self.aggregates.endpoints.put(metric);
        }

        if segment.duration_ms() >= self.slow_trace_threshold_ms {
            self.aggregates
                .slow_traces
                .put(SlowTrace::from_segment(&segment));
        }

        self.aggregates
            .segments
            .write(SegmentRecord::from_segment(&segment));

        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(
            segment_id = %segment.segment_id,
            service = %segment.service,
            spans = segment.spans.len(),
            "segment aggregated",
        );

        true
    }
}
