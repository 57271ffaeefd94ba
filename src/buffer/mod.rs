//! Disk-backed segment buffer.
//!
//! Received records are appended to rolling `data_<millis>.sw` files by the
//! [`SegmentWriter`] and replayed in write order by the [`SegmentReader`].
//! The two sides coordinate only through the filesystem and the
//! [`OffsetTracker`], whose cursor is flushed to `offset_<millis>.sw` files on
//! an interval. Replay is at-least-once: records consumed after the last
//! cursor flush are delivered again after a crash.

pub mod codec;
pub mod file;
pub mod offset;
pub mod reader;
pub mod stats;
pub mod writer;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BufferConfig;

pub use offset::{Cursor, OffsetTracker, Position};
pub use reader::{RecordHandler, ReplayOutcome, SegmentReader, TickReport};
pub use stats::{BufferStats, BufferStatsSnapshot};
pub use writer::SegmentWriter;

use file::DirLock;

/// Errors raised by the segment buffer.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("creating buffer directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("buffer directory {} is in use by another process", path.display())]
    Locked { path: PathBuf },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },
}

impl BufferError {
    /// Returns a `map_err` adapter attaching the failed operation and path.
    pub(crate) fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> BufferError {
        let path = path.to_path_buf();
        move |source| BufferError::Io { op, path, source }
    }
}

/// An opened buffer directory: lock held, cursor loaded, writer ready.
pub struct SegmentBuffer {
    cfg: BufferConfig,
    _lock: DirLock,
    offsets: Arc<OffsetTracker>,
    writer: Arc<SegmentWriter>,
    stats: Arc<BufferStats>,
}

impl SegmentBuffer {
    /// Opens the buffer directory.
    ///
    /// Fails when the directory cannot be created or another process holds
    /// its lock. With `clean_buffer_on_restart` every data and offset file is
    /// deleted before the cursor is loaded.
    pub fn open(cfg: &BufferConfig) -> Result<Self, BufferError> {
        let dir = cfg.buffer_path.as_path();
        file::ensure_dir(dir)?;
        let lock = DirLock::acquire(dir)?;

        if cfg.clean_buffer_on_restart {
            let removed = file::clean(dir)?;
            info!(path = %dir.display(), removed, "cleaned segment buffer on restart");
        }

        let stats = Arc::new(BufferStats::new());
        let offsets = Arc::new(OffsetTracker::open(dir, cfg.max_offset_file_size)?);
        let writer = Arc::new(SegmentWriter::open(
            dir,
            cfg.max_segment_file_size,
            Arc::clone(&offsets),
            Arc::clone(&stats),
        )?);

        // A crash can leave the write file shorter than the flushed cursor.
        // The writer resumes at the last complete frame; a read offset past
        // it would skip everything appended from there.
        let cursor = offsets.snapshot();
        if cursor.read.file_name == cursor.write.file_name
            && cursor.read.offset > cursor.write.offset
        {
            warn!(
                file = %cursor.read.file_name,
                read_offset = cursor.read.offset,
                write_offset = cursor.write.offset,
                "read cursor past end of segment file, rewinding",
            );
            offsets.set_read_position(&cursor.write.file_name, cursor.write.offset);
        }

        info!(
            path = %dir.display(),
            lock = %lock.path().display(),
            max_segment_file_size = cfg.max_segment_file_size,
            max_offset_file_size = cfg.max_offset_file_size,
            "segment buffer opened",
        );

        Ok(Self {
            cfg: cfg.clone(),
            _lock: lock,
            offsets,
            writer,
            stats,
        })
    }

    pub fn writer(&self) -> Arc<SegmentWriter> {
        Arc::clone(&self.writer)
    }

    pub fn offsets(&self) -> Arc<OffsetTracker> {
        Arc::clone(&self.offsets)
    }

    pub fn stats(&self) -> Arc<BufferStats> {
        Arc::clone(&self.stats)
    }

    /// Builds a reader delivering to `handler`.
    pub fn reader(&self, handler: Arc<dyn RecordHandler>) -> SegmentReader {
        SegmentReader::new(
            &self.cfg.buffer_path,
            Arc::clone(&self.offsets),
            Arc::clone(&self.stats),
            handler,
        )
    }

    /// Spawns the reader tick and the cursor flush loop.
    ///
    /// Both stop between ticks once `cancel` fires; the flush loop writes the
    /// cursor one last time on the way out.
    pub fn spawn(
        &self,
        handler: Arc<dyn RecordHandler>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_reader(handler, cancel.clone()),
            self.spawn_offset_flusher(cancel),
        ]
    }

    fn spawn_reader(
        &self,
        handler: Arc<dyn RecordHandler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let reader = Arc::new(self.reader(handler));
        let interval = self.cfg.read_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let reader = Arc::clone(&reader);
                        match tokio::task::spawn_blocking(move || reader.tick()).await {
                            Ok(Ok(report)) if report.replayed > 0 => {
                                debug!(
                                    file = report.file.as_deref().unwrap_or_default(),
                                    replayed = report.replayed,
                                    outcome = ?report.outcome,
                                    "segment replay tick",
                                );
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "segment replay tick failed"),
                            Err(e) => warn!(error = %e, "segment replay task panicked"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_offset_flusher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let offsets = Arc::clone(&self.offsets);
        let stats = Arc::clone(&self.stats);
        let initial_delay = self.cfg.offset_flush_initial_delay;
        let interval = self.cfg.offset_flush_interval;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(initial_delay) => {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => flush_offsets(&offsets, &stats).await,
                        }
                    }
                }
            }

            flush_offsets(&offsets, &stats).await;
        })
    }
}

async fn flush_offsets(offsets: &Arc<OffsetTracker>, stats: &Arc<BufferStats>) {
    let offsets = Arc::clone(offsets);
    match tokio::task::spawn_blocking(move || offsets.flush()).await {
        Ok(Ok(true)) => stats.record_offset_flush(),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => warn!(error = %e, "buffer cursor flush failed"),
        Err(e) => warn!(error = %e, "buffer cursor flush task panicked"),
    }
}
