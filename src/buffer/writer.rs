use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::codec;
use super::file::{self, FileKind};
use super::offset::OffsetTracker;
use super::stats::BufferStats;
use super::BufferError;

struct WriterState {
    name: String,
    file: File,
    len: u64,
}

/// Appends framed records to the current data file, rotating to a new file
/// once the size cap is exceeded.
///
/// All producers share one lock, so a slow disk back-pressures every caller.
pub struct SegmentWriter {
    dir: PathBuf,
    max_file_size: u64,
    offsets: Arc<OffsetTracker>,
    stats: Arc<BufferStats>,
    state: Mutex<WriterState>,
}

impl SegmentWriter {
    /// Opens the write target named by the cursor, or a fresh data file when
    /// the cursor names none.
    ///
    /// A torn frame at the end of a reopened file is truncated so the next
    /// append starts on a frame boundary.
    pub fn open(
        dir: &Path,
        max_file_size: u64,
        offsets: Arc<OffsetTracker>,
        stats: Arc<BufferStats>,
    ) -> Result<Self, BufferError> {
        let cursor = offsets.write_position();
        let existing = !cursor.is_unset() && dir.join(&cursor.file_name).is_file();

        let state = if existing {
            reopen(dir, &cursor.file_name)?
        } else {
            let (name, file) = file::create(dir, FileKind::Data)?;
            info!(file = %name, "opened new segment file");
            WriterState { name, file, len: 0 }
        };

        offsets.set_write_position(&state.name, state.len);

        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            offsets,
            stats,
            state: Mutex::new(state),
        })
    }

    /// Appends one record.
    ///
    /// On failure nothing is left half-written: the file is truncated back to
    /// its previous length and the write cursor does not move.
    pub fn write_record(&self, record: &[u8]) -> Result<(), BufferError> {
        let frame = match codec::encode(record) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.record_write_error();
                return Err(e);
            }
        };

        let mut state = self.state.lock();

        if let Err(e) = state.file.write_all(&frame) {
            self.stats.record_write_error();
            let path = self.dir.join(&state.name);
            if let Err(rollback) = state.file.set_len(state.len) {
                error!(
                    file = %state.name,
                    offset = state.len,
                    error = %rollback,
                    "failed to roll back partial segment write",
                );
            }
            return Err(BufferError::io("appending record", &path)(e));
        }

        state.len += frame.len() as u64;
        self.stats.record_write(frame.len() as u64);

        if state.len > self.max_file_size {
            self.rotate(&mut state);
        } else {
            self.offsets.set_write_position(&state.name, state.len);
        }

        Ok(())
    }

    /// Name of the data file currently written to.
    pub fn current_file(&self) -> String {
        self.state.lock().name.clone()
    }

    fn rotate(&self, state: &mut WriterState) {
        match file::create(&self.dir, FileKind::Data) {
            Ok((name, file)) => {
                debug!(from = %state.name, to = %name, size = state.len, "rotated segment file");
                *state = WriterState { name, file, len: 0 };
                self.stats.record_rotation();
            }
            Err(e) => {
                // Keep appending to the oversized file; the next write retries.
                warn!(file = %state.name, error = %e, "segment file rotation failed");
            }
        }
        self.offsets.set_write_position(&state.name, state.len);
    }
}

fn reopen(dir: &Path, name: &str) -> Result<WriterState, BufferError> {
    let path = dir.join(name);
    let content = fs::read(&path).map_err(BufferError::io("reading segment file", &path))?;
    let valid = codec::complete_prefix_len(&content);

    let file = OpenOptions::new()
        .append(true)
        .read(true)
        .open(&path)
        .map_err(BufferError::io("opening segment file", &path))?;

    if valid < content.len() {
        warn!(
            file = %name,
            offset = valid,
            dropped_bytes = content.len() - valid,
            "truncating torn record at end of segment file",
        );
        file.set_len(valid as u64)
            .map_err(BufferError::io("truncating segment file", &path))?;
    }

    info!(file = %name, offset = valid, "reopened segment file");

    Ok(WriterState {
        name: name.to_string(),
        file,
        len: valid as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::codec::LENGTH_PREFIX;
    use crate::buffer::offset::Position;

    fn open(dir: &Path, max: u64) -> (Arc<OffsetTracker>, SegmentWriter) {
        let offsets = Arc::new(OffsetTracker::open(dir, 1024 * 1024).expect("offsets"));
        let writer = SegmentWriter::open(
            dir,
            max,
            Arc::clone(&offsets),
            Arc::new(BufferStats::new()),
        )
        .expect("writer");
        (offsets, writer)
    }

    #[test]
    fn test_write_advances_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (offsets, writer) = open(dir.path(), 1024);

        writer.write_record(b"hello").expect("write");
        writer.write_record(b"world!").expect("write");

        let expected = (2 * LENGTH_PREFIX + 11) as u64;
        assert_eq!(
            offsets.write_position(),
            Position::new(writer.current_file(), expected)
        );
        let len = fs::metadata(dir.path().join(writer.current_file()))
            .expect("metadata")
            .len();
        assert_eq!(len, expected);
    }

    #[test]
    fn test_rotates_after_exceeding_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (offsets, writer) = open(dir.path(), 16);
        let first = writer.current_file();

        // 4 + 10 = 14 bytes, under the cap.
        writer.write_record(b"0123456789").expect("write");
        assert_eq!(writer.current_file(), first);

        // 28 bytes, over the cap: rotate after the append.
        writer.write_record(b"0123456789").expect("write");
        let second = writer.current_file();
        assert_ne!(second, first);
        assert!(file::is_older(FileKind::Data, &first, &second));
        assert_eq!(offsets.write_position(), Position::new(second.clone(), 0));

        let first_len = fs::metadata(dir.path().join(&first)).expect("metadata").len();
        assert_eq!(first_len, 28);
    }

    #[test]
    fn test_reopen_appends_to_cursor_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = {
            let (offsets, writer) = open(dir.path(), 1024);
            writer.write_record(b"before restart").expect("write");
            offsets.flush().expect("flush");
            writer.current_file()
        };

        let (offsets, writer) = open(dir.path(), 1024);
        assert_eq!(writer.current_file(), name);
        writer.write_record(b"after").expect("write");

        let content = fs::read(dir.path().join(&name)).expect("read");
        assert_eq!(codec::complete_prefix_len(&content), content.len());
        assert_eq!(offsets.write_position().offset, content.len() as u64);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = {
            let (offsets, writer) = open(dir.path(), 1024);
            writer.write_record(b"complete").expect("write");
            offsets.flush().expect("flush");
            writer.current_file()
        };

        let torn = codec::encode(b"torn record").expect("encode");
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(&name))
            .expect("open");
        f.write_all(&torn[..7]).expect("append torn bytes");
        drop(f);

        let (offsets, writer) = open(dir.path(), 1024);
        let complete = (LENGTH_PREFIX + 8) as u64;
        assert_eq!(offsets.write_position(), Position::new(name.clone(), complete));

        writer.write_record(b"next").expect("write");
        let content = fs::read(dir.path().join(&name)).expect("read");
        assert_eq!(codec::complete_prefix_len(&content), content.len());
    }

    #[test]
    fn test_missing_cursor_file_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let offsets = OffsetTracker::open(dir.path(), 1024).expect("offsets");
            offsets.set_write_position("data_1.sw", 77);
            offsets.flush().expect("flush");
        }

        let (offsets, writer) = open(dir.path(), 1024);
        assert_ne!(writer.current_file(), "data_1.sw");
        assert_eq!(offsets.write_position().offset, 0);
    }
}
