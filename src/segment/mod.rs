//! Trace segment records as received from agents.
//!
//! A segment is the set of spans one service instance produced for one trace.
//! Records are JSON; [`parse`] decodes and validates them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while decoding a segment record.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("decoding segment json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("segment is missing {field}")]
    MissingField { field: &'static str },

    #[error("segment {segment_id} has no spans")]
    NoSpans { segment_id: String },

    #[error("span {span_id} ends before it starts ({start} > {end})")]
    InvalidSpanTime { span_id: i32, start: i64, end: i64 },
}

/// Role of a span within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Receives a request from another service.
    Entry,
    /// Calls another service.
    Exit,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: i32,
    #[serde(default = "default_parent_span_id")]
    pub parent_span_id: i32,
    pub kind: SpanKind,
    pub operation: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
}

impl Span {
    pub fn duration_ms(&self) -> i64 {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id < 0
    }
}

fn default_parent_span_id() -> i32 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSegment {
    pub trace_id: String,
    pub segment_id: String,
    pub service: String,
    #[serde(default)]
    pub instance: String,
    pub spans: Vec<Span>,
}

impl TraceSegment {
    /// Earliest span start in milliseconds.
    pub fn start_time(&self) -> i64 {
        self.spans.iter().map(|s| s.start_time).min().unwrap_or_default()
    }

    /// Latest span end in milliseconds.
    pub fn end_time(&self) -> i64 {
        self.spans.iter().map(|s| s.end_time).max().unwrap_or_default()
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time().saturating_sub(self.start_time())
    }

    pub fn is_error(&self) -> bool {
        self.spans.iter().any(|s| s.is_error)
    }

    /// The span through which the request entered this service: the root
    /// entry span when there is one, otherwise the first entry span.
    pub fn entry_span(&self) -> Option<&Span> {
        self.spans
            .iter()
            .find(|s| s.kind == SpanKind::Entry && s.is_root())
            .or_else(|| self.spans.iter().find(|s| s.kind == SpanKind::Entry))
    }

    /// Operation name of the entry span, falling back to the root span.
    pub fn endpoint(&self) -> Option<&str> {
        self.entry_span()
            .or_else(|| self.spans.iter().find(|s| s.is_root()))
            .map(|s| s.operation.as_str())
    }
}

/// Decode and validate one segment record.
pub fn parse(data: &[u8]) -> Result<TraceSegment, ParseError> {
    let segment: TraceSegment = serde_json::from_slice(data)?;

    for (field, value) in [
        ("trace_id", &segment.trace_id),
        ("segment_id", &segment.segment_id),
        ("service", &segment.service),
    ] {
        if value.is_empty() {
            return Err(ParseError::MissingField { field });
        }
    }

    if segment.spans.is_empty() {
        return Err(ParseError::NoSpans {
            segment_id: segment.segment_id,
        });
    }

    if let Some(span) = segment.spans.iter().find(|s| s.end_time < s.start_time) {
        return Err(ParseError::InvalidSpanTime {
            span_id: span.span_id,
            start: span.start_time,
            end: span.end_time,
        });
    }

    Ok(segment)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a JSON segment with one root entry span and one exit span.
    pub(crate) fn segment_json(
        service: &str,
        endpoint: &str,
        start: i64,
        duration: i64,
    ) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "trace_id": format!("trace-{start}"),
            "segment_id": format!("seg-{service}-{start}"),
            "service": service,
            "instance": "instance-1",
            "spans": [
                {
                    "span_id": 0,
                    "kind": "entry",
                    "operation": endpoint,
                    "start_time": start,
                    "end_time": start + duration,
                },
                {
                    "span_id": 1,
                    "parent_span_id": 0,
                    "kind": "exit",
                    "operation": "db.query",
                    "start_time": start + 1,
                    "end_time": start + 2,
                    "peer": "db:5432",
                },
            ],
        }))
        .expect("serialize")
    }

    #[test]
    fn test_parse_segment() {
        let segment = parse(&segment_json("checkout", "/pay", 1_000, 250)).expect("parse");
        assert_eq!(segment.service, "checkout");
        assert_eq!(segment.spans.len(), 2);
        assert_eq!(segment.spans[0].parent_span_id, -1);
        assert_eq!(segment.endpoint(), Some("/pay"));
        assert_eq!(segment.duration_ms(), 250);
        assert!(!segment.is_error());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse(b"not json"), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_parse_rejects_missing_service() {
        let data = br#"{"trace_id":"t","segment_id":"s","service":"","spans":[]}"#;
        let err = parse(data).unwrap_err();
        assert!(matches!(err, ParseError::MissingField { field: "service" }));
    }

    #[test]
    fn test_parse_rejects_empty_spans() {
        let data = br#"{"trace_id":"t","segment_id":"s","service":"svc","spans":[]}"#;
        assert!(matches!(parse(data), Err(ParseError::NoSpans { .. })));
    }

    #[test]
    fn test_parse_rejects_inverted_span() {
        let data = br#"{"trace_id":"t","segment_id":"s","service":"svc","spans":[
            {"span_id":3,"kind":"local","operation":"x","start_time":10,"end_time":5}
        ]}"#;
        let err = parse(data).unwrap_err();
        assert_eq!(err.to_string(), "span 3 ends before it starts (10 > 5)");
    }

    #[test]
    fn test_endpoint_falls_back_to_root_span() {
        let data = br#"{"trace_id":"t","segment_id":"s","service":"svc","spans":[
            {"span_id":0,"kind":"local","operation":"cron.job","start_time":1,"end_time":2,"is_error":true}
        ]}"#;
        let segment = parse(data).expect("parse");
        assert!(segment.entry_span().is_none());
        assert_eq!(segment.endpoint(), Some("cron.job"));
        assert!(segment.is_error());
    }

    #[test]
    fn test_duration_saturates_at_extreme_timestamps() {
        let data = format!(
            r#"{{"trace_id":"t","segment_id":"s","service":"svc","spans":[
                {{"span_id":0,"kind":"entry","operation":"/a","start_time":{min},"end_time":{min}}},
                {{"span_id":1,"parent_span_id":0,"kind":"exit","operation":"db","start_time":0,"end_time":{max}}}
            ]}}"#,
            min = i64::MIN,
            max = i64::MAX,
        );
        let segment = parse(data.as_bytes()).expect("parse");

        assert_eq!(segment.duration_ms(), i64::MAX);
        assert_eq!(segment.spans[1].duration_ms(), i64::MAX);
        assert_eq!(segment.spans[0].duration_ms(), 0);
    }
}
