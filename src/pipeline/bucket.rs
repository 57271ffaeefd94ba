//! Time buckets encoded as decimal integers.
//!
//! A minute bucket reads `yyyyMMddHHmm`; coarser buckets drop trailing
//! fields, so `202401021504` becomes `2024010215`, `20240102` and `202401`.

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;

/// Granularity of a metric bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsampling {
    Minute,
    Hour,
    Day,
    Month,
}

impl Downsampling {
    pub const ALL: [Downsampling; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// The next coarser granularity, if any.
    pub const fn coarser(self) -> Option<Self> {
        match self {
            Self::Minute => Some(Self::Hour),
            Self::Hour => Some(Self::Day),
            Self::Day => Some(Self::Month),
            Self::Month => None,
        }
    }

    /// Divisor turning a minute bucket into a bucket of this granularity.
    const fn divisor(self) -> i64 {
        match self {
            Self::Minute => 1,
            Self::Hour => 100,
            Self::Day => 10_000,
            Self::Month => 1_000_000,
        }
    }

    /// Bucket containing `timestamp_ms` (UTC).
    ///
    /// Timestamps outside chrono's range fall into bucket 0.
    pub fn bucket(self, timestamp_ms: i64) -> i64 {
        minute_bucket(timestamp_ms) / self.divisor()
    }

    /// Re-buckets a bucket of `from` granularity into this one.
    ///
    /// Returns `None` when `from` is coarser than `self`.
    pub fn rebucket(self, bucket: i64, from: Downsampling) -> Option<i64> {
        if from > self {
            return None;
        }
        Some(bucket * from.divisor() / self.divisor())
    }
}

impl fmt::Display for Downsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn minute_bucket(timestamp_ms: i64) -> i64 {
    let Some(t) = DateTime::<Utc>::from_timestamp_millis(timestamp_ms) else {
        return 0;
    };

    i64::from(t.year()) * 100_000_000
        + i64::from(t.month()) * 1_000_000
        + i64::from(t.day()) * 10_000
        + i64::from(t.hour()) * 100
        + i64::from(t.minute())
}
