use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for the segment buffer.
///
/// `snapshot()` atomically reads and resets all counters, so the periodic
/// stats tick can turn them into prometheus increments without contention.
#[derive(Default)]
pub struct BufferStats {
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
    records_replayed: AtomicU64,
    replay_paused: AtomicU64,
    torn_records: AtomicU64,
    files_rotated: AtomicU64,
    files_deleted: AtomicU64,
    offset_flushes: AtomicU64,
}

/// Counter values taken by [`BufferStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub records_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub records_replayed: u64,
    pub replay_paused: u64,
    pub torn_records: u64,
    pub files_rotated: u64,
    pub files_deleted: u64,
    pub offset_flushes: u64,
}

impl BufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, bytes: u64) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self, n: u64) {
        self.records_replayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_paused(&self) {
        self.replay_paused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_torn(&self) {
        self.torn_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.files_rotated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, n: u64) {
        self.files_deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_offset_flush(&self) {
        self.offset_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            records_written: self.records_written.swap(0, Ordering::Relaxed),
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            write_errors: self.write_errors.swap(0, Ordering::Relaxed),
            records_replayed: self.records_replayed.swap(0, Ordering::Relaxed),
            replay_paused: self.replay_paused.swap(0, Ordering::Relaxed),
            torn_records: self.torn_records.swap(0, Ordering::Relaxed),
            files_rotated: self.files_rotated.swap(0, Ordering::Relaxed),
            files_deleted: self.files_deleted.swap(0, Ordering::Relaxed),
            offset_flushes: self.offset_flushes.swap(0, Ordering::Relaxed),
        }
    }
}
