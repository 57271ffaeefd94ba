use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::codec::{self, Frame};
use super::file::{self, FileKind};
use super::offset::OffsetTracker;
use super::stats::BufferStats;
use super::BufferError;

/// Consumer of replayed records.
///
/// Returning `false` means "not accepted, retry later": the record's offset
/// is not committed and the current tick stops.
pub trait RecordHandler: Send + Sync {
    fn handle(&self, record: &[u8]) -> bool;
}

impl<F> RecordHandler for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn handle(&self, record: &[u8]) -> bool {
        self(record)
    }
}

/// How a reader tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// No data file exists.
    Idle,
    /// Replayed up to the writer's current offset.
    CaughtUp,
    /// A file the writer no longer appends to was consumed and deleted.
    Drained,
    /// The handler refused a record.
    Paused,
}

/// Summary of one reader tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub file: Option<String>,
    pub replayed: usize,
    pub outcome: ReplayOutcome,
}

impl TickReport {
    fn idle() -> Self {
        Self {
            file: None,
            replayed: 0,
            outcome: ReplayOutcome::Idle,
        }
    }
}

/// Replays buffered records to a [`RecordHandler`] in write order.
///
/// Each tick consumes at most one data file. The reader never looks past the
/// writer's cursor when both are on the same file.
pub struct SegmentReader {
    dir: PathBuf,
    offsets: Arc<OffsetTracker>,
    stats: Arc<BufferStats>,
    handler: Arc<dyn RecordHandler>,
}

impl SegmentReader {
    pub fn new(
        dir: &Path,
        offsets: Arc<OffsetTracker>,
        stats: Arc<BufferStats>,
        handler: Arc<dyn RecordHandler>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            offsets,
            stats,
            handler,
        }
    }

    /// Runs one replay pass.
    pub fn tick(&self) -> Result<TickReport, BufferError> {
        let Some((target, start)) = self.determine_target()? else {
            return Ok(TickReport::idle());
        };

        let write = self.offsets.write_position();
        let is_write_target = write.file_name == target;

        let path = self.dir.join(&target);
        let mut f = File::open(&path).map_err(BufferError::io("opening segment file", &path))?;
        let end = if is_write_target {
            write.offset
        } else {
            f.metadata()
                .map_err(BufferError::io("inspecting segment file", &path))?
                .len()
        };

        let buf = if start < end {
            let mut buf = vec![0u8; (end - start) as usize];
            f.seek(SeekFrom::Start(start))
                .map_err(BufferError::io("seeking segment file", &path))?;
            f.read_exact(&mut buf)
                .map_err(BufferError::io("reading segment file", &path))?;
            buf
        } else {
            Vec::new()
        };

        let mut pos = 0usize;
        let mut replayed = 0usize;
        let mut corrupt = None;

        loop {
            match codec::decode(&buf[pos..]) {
                Frame::Record { payload, len } => {
                    if !self.handler.handle(payload) {
                        self.stats.record_replayed(replayed as u64);
                        self.stats.record_paused();
                        debug!(
                            file = %target,
                            offset = start + pos as u64,
                            "replay paused by handler",
                        );
                        return Ok(TickReport {
                            file: Some(target),
                            replayed,
                            outcome: ReplayOutcome::Paused,
                        });
                    }
                    pos += len;
                    replayed += 1;
                    self.offsets.set_read_position(&target, start + pos as u64);
                }
                Frame::Incomplete => break,
                Frame::Corrupt { declared } => {
                    corrupt = Some(declared);
                    break;
                }
            }
        }

        self.stats.record_replayed(replayed as u64);
        let stopped_at = start + pos as u64;

        if is_write_target {
            if let Some(declared) = corrupt {
                error!(
                    file = %target,
                    offset = stopped_at,
                    declared,
                    "corrupt record in active segment file",
                );
            }
            return Ok(TickReport {
                file: Some(target),
                replayed,
                outcome: ReplayOutcome::CaughtUp,
            });
        }

        if pos < buf.len() {
            self.stats.record_torn();
            warn!(
                file = %target,
                offset = stopped_at,
                skipped_bytes = buf.len() - pos,
                corrupt = corrupt.is_some(),
                "skipping unreadable tail of segment file",
            );
        }

        file::remove(&self.dir, &target)?;
        self.stats.record_deleted(1);
        debug!(file = %target, replayed, "segment file drained");

        if let Some(next) = file::oldest(&self.dir, FileKind::Data)? {
            let read = self.offsets.read_position();
            if read.file_name != next || read.offset != 0 {
                self.offsets.set_read_position(&next, 0);
            }
        }

        Ok(TickReport {
            file: Some(target),
            replayed,
            outcome: ReplayOutcome::Drained,
        })
    }

    /// Picks the file to replay and its start offset, deleting data files
    /// older than the cursor's file.
    fn determine_target(&self) -> Result<Option<(String, u64)>, BufferError> {
        let read = self.offsets.read_position();

        if !read.is_unset() && self.dir.join(&read.file_name).is_file() {
            self.delete_older_than(&read.file_name)?;
            return Ok(Some((read.file_name, read.offset)));
        }

        let Some(oldest) = file::oldest(&self.dir, FileKind::Data)? else {
            return Ok(None);
        };

        if !read.is_unset() {
            debug!(missing = %read.file_name, next = %oldest, "read cursor file gone, moving on");
        }
        self.offsets.set_read_position(&oldest, 0);

        Ok(Some((oldest, 0)))
    }

    fn delete_older_than(&self, name: &str) -> Result<(), BufferError> {
        let write_file = self.offsets.write_position().file_name;
        let mut deleted = 0u64;

        for (_, candidate) in file::list(&self.dir, FileKind::Data)? {
            if candidate == write_file || !file::is_older(FileKind::Data, &candidate, name) {
                continue;
            }
            file::remove(&self.dir, &candidate)?;
            deleted += 1;
            warn!(file = %candidate, "deleted stale segment file older than read cursor");
        }

        self.stats.record_deleted(deleted);
        Ok(())
    }
}
