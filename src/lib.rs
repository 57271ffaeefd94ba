//! Trace segment collector.
//!
//! Received segments are appended to a disk-backed buffer, replayed into
//! double-buffered aggregation caches and periodically persisted to the
//! configured exporters.

pub mod agent;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod export;
pub mod persist;
pub mod pipeline;
pub mod segment;
