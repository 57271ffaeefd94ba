use std::cmp::Ordering;

use serde::Serialize;

use super::bucket::Downsampling;
use crate::cache::{Keyed, Mergeable};
use crate::segment::TraceSegment;

/// Identity of an endpoint metric row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub time_bucket: i64,
    pub downsampling: Downsampling,
    pub service: String,
    pub endpoint: String,
}

/// Call statistics for one endpoint in one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointMetric {
    pub time_bucket: i64,
    pub downsampling: Downsampling,
    pub service: String,
    pub endpoint: String,
    pub calls: u64,
    pub errors: u64,
    pub duration_sum_ms: i64,
    pub duration_min_ms: i64,
    pub duration_max_ms: i64,
}

impl EndpointMetric {
    /// One call observed through the segment's entry span, in its minute
    /// bucket. Segments without an endpoint yield nothing.
    pub fn from_segment(segment: &TraceSegment) -> Option<Self> {
        let span = segment
            .entry_span()
            .or_else(|| segment.spans.iter().find(|s| s.is_root()))?;
        let duration = span.duration_ms();

        Some(Self {
            time_bucket: Downsampling::Minute.bucket(span.start_time),
            downsampling: Downsampling::Minute,
            service: segment.service.clone(),
            endpoint: span.operation.clone(),
            calls: 1,
            errors: u64::from(span.is_error),
            duration_sum_ms: duration,
            duration_min_ms: duration,
            duration_max_ms: duration,
        })
    }

    /// The same statistics in a coarser bucket.
    pub fn rebucket(&self, to: Downsampling) -> Option<Self> {
        let time_bucket = to.rebucket(self.time_bucket, self.downsampling)?;
        Some(Self {
            time_bucket,
            downsampling: to,
            ..self.clone()
        })
    }

    pub fn avg_ms(&self) -> i64 {
        if self.calls == 0 {
            return 0;
        }
        self.duration_sum_ms / self.calls as i64
    }
}

impl Keyed for EndpointMetric {
    type Key = EndpointKey;

    fn key(&self) -> EndpointKey {
        EndpointKey {
            time_bucket: self.time_bucket,
            downsampling: self.downsampling,
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

impl Mergeable for EndpointMetric {
    fn combine(&mut self, other: Self) {
        self.calls += other.calls;
        self.errors += other.errors;
        self.duration_sum_ms = self.duration_sum_ms.saturating_add(other.duration_sum_ms);
        self.duration_min_ms = self.duration_min_ms.min(other.duration_min_ms);
        self.duration_max_ms = self.duration_max_ms.max(other.duration_max_ms);
    }
}

/// A segment slow enough to be sampled, ranked per service by duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowTrace {
    pub service: String,
    pub endpoint: String,
    pub trace_id: String,
    pub segment_id: String,
    pub start_time: i64,
    pub duration_ms: i64,
    pub is_error: bool,
}

impl SlowTrace {
    pub fn from_segment(segment: &TraceSegment) -> Self {
        Self {
            service: segment.service.clone(),
            endpoint: segment.endpoint().unwrap_or_default().to_string(),
            trace_id: segment.trace_id.clone(),
            segment_id: segment.segment_id.clone(),
            start_time: segment.start_time(),
            duration_ms: segment.duration_ms(),
            is_error: segment.is_error(),
        }
    }

    /// Ranking used by the top-N window.
    pub fn by_duration(a: &Self, b: &Self) -> Ordering {
        a.duration_ms.cmp(&b.duration_ms)
    }
}

impl Keyed for SlowTrace {
    type Key = String;

    fn key(&self) -> String {
        self.service.clone()
    }
}

/// Index row for every received segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentRecord {
    pub segment_id: String,
    pub trace_id: String,
    pub service: String,
    pub instance: String,
    pub endpoint: String,
    pub time_bucket: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: i64,
    pub is_error: bool,
    pub span_count: usize,
}

impl SegmentRecord {
    pub fn from_segment(segment: &TraceSegment) -> Self {
        let start_time = segment.start_time();
        Self {
            segment_id: segment.segment_id.clone(),
            trace_id: segment.trace_id.clone(),
            service: segment.service.clone(),
            instance: segment.instance.clone(),
            endpoint: segment.endpoint().unwrap_or_default().to_string(),
            time_bucket: Downsampling::Minute.bucket(start_time),
            start_time,
            end_time: segment.end_time(),
            duration_ms: segment.duration_ms(),
            is_error: segment.is_error(),
            span_count: segment.spans.len(),
        }
    }
}
