use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::file::{self, FileKind};
use super::BufferError;

/// A (file, byte offset) pair inside the buffer directory.
///
/// An empty file name means "no file yet".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub file_name: String,
    pub offset: u64,
}

impl Position {
    pub fn new(file_name: impl Into<String>, offset: u64) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
        }
    }

    /// Returns true when no file has been assigned.
    pub fn is_unset(&self) -> bool {
        self.file_name.is_empty()
    }
}

/// Read and write positions of the segment buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub read: Position,
    pub write: Position,
}

impl Cursor {
    /// Serializes as `readFile,readOffset,writeFile,writeOffset`.
    pub fn serialize(&self) -> String {
        format!(
            "{},{},{},{}",
            self.read.file_name, self.read.offset, self.write.file_name, self.write.offset
        )
    }

    /// Parses a serialized cursor. Anything malformed yields the default
    /// cursor, which at worst re-delivers records but never skips them.
    pub fn deserialize(line: &str) -> Self {
        let parts: Vec<&str> = line.trim().split(',').collect();
        let [read_file, read_offset, write_file, write_offset] = parts.as_slice() else {
            return Self::default();
        };

        match (read_offset.parse::<u64>(), write_offset.parse::<u64>()) {
            (Ok(read_offset), Ok(write_offset)) => Self {
                read: Position::new(*read_file, read_offset),
                write: Position::new(*write_file, write_offset),
            },
            _ => Self::default(),
        }
    }
}

struct OffsetFile {
    name: String,
    handle: File,
    last_flushed: String,
}

/// Persists the segment buffer's read and write cursors.
///
/// Accessors only touch memory; `flush` appends the current cursor to a
/// rolling offset file. A crash loses at most the cursor movement since the
/// last flush, which leads to re-delivery, never to skipped records.
pub struct OffsetTracker {
    dir: PathBuf,
    max_file_size: u64,
    cursor: Mutex<Cursor>,
    file: Mutex<OffsetFile>,
}

impl OffsetTracker {
    /// Loads the newest cursor from `dir`, deleting older offset files, or
    /// starts an empty cursor when none exists.
    pub fn open(dir: &Path, max_file_size: u64) -> Result<Self, BufferError> {
        file::ensure_dir(dir)?;

        let mut existing = file::list(dir, FileKind::Offset)?;
        let newest = existing.pop();

        for (_, stale) in existing {
            file::remove(dir, &stale)?;
            debug!(file = %stale, "deleted stale offset file");
        }

        let (cursor, offset_file) = match newest {
            Some((_, name)) => {
                let path = dir.join(&name);
                let content = fs::read_to_string(&path)
                    .map_err(BufferError::io("reading offset file", &path))?;
                let last_line = content
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or_default()
                    .trim()
                    .to_string();

                let cursor = Cursor::deserialize(&last_line);
                if cursor == Cursor::default() && !last_line.is_empty() {
                    warn!(
                        file = %name,
                        line = %last_line,
                        "malformed cursor, starting from zero offsets",
                    );
                }

                let handle = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(BufferError::io("opening offset file", &path))?;

                info!(
                    file = %name,
                    read_file = %cursor.read.file_name,
                    read_offset = cursor.read.offset,
                    write_file = %cursor.write.file_name,
                    write_offset = cursor.write.offset,
                    "loaded buffer cursor",
                );

                let offset_file = OffsetFile {
                    name,
                    handle,
                    last_flushed: last_line,
                };
                (cursor, offset_file)
            }
            None => {
                let cursor = Cursor::default();
                let line = cursor.serialize();
                let (name, mut handle) = file::create(dir, FileKind::Offset)?;
                append_line(&mut handle, &dir.join(&name), &line)?;
                info!(file = %name, "created new buffer cursor");

                let offset_file = OffsetFile {
                    name,
                    handle,
                    last_flushed: line,
                };
                (cursor, offset_file)
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            cursor: Mutex::new(cursor),
            file: Mutex::new(offset_file),
        })
    }

    pub fn read_position(&self) -> Position {
        self.cursor.lock().read.clone()
    }

    pub fn set_read_position(&self, file_name: &str, offset: u64) {
        let mut cursor = self.cursor.lock();
        if cursor.read.file_name != file_name {
            cursor.read.file_name = file_name.to_string();
        }
        cursor.read.offset = offset;
    }

    pub fn write_position(&self) -> Position {
        self.cursor.lock().write.clone()
    }

    pub fn set_write_position(&self, file_name: &str, offset: u64) {
        let mut cursor = self.cursor.lock();
        if cursor.write.file_name != file_name {
            cursor.write.file_name = file_name.to_string();
        }
        cursor.write.offset = offset;
    }

    /// Returns a copy of both positions.
    pub fn snapshot(&self) -> Cursor {
        self.cursor.lock().clone()
    }

    /// Name of the offset file currently appended to.
    pub fn current_file(&self) -> String {
        self.file.lock().name.clone()
    }

    /// Appends the current cursor to the offset file.
    ///
    /// Returns `Ok(false)` without touching the disk when the cursor has not
    /// changed since the previous flush.
    pub fn flush(&self) -> Result<bool, BufferError> {
        let line = self.snapshot().serialize();

        let mut current = self.file.lock();
        if current.last_flushed == line {
            return Ok(false);
        }

        let path = self.dir.join(&current.name);
        let size = current
            .handle
            .metadata()
            .map_err(BufferError::io("inspecting offset file", &path))?
            .len();

        if size > self.max_file_size {
            let (name, handle) = file::create(&self.dir, FileKind::Offset)?;
            let previous = std::mem::replace(&mut current.name, name);
            current.handle = handle;
            file::remove(&self.dir, &previous)?;
            debug!(from = %previous, to = %current.name, "rotated offset file");
        }

        let path = self.dir.join(&current.name);
        append_line(&mut current.handle, &path, &line)?;
        current.last_flushed = line;

        Ok(true)
    }
}

fn append_line(handle: &mut File, path: &Path, line: &str) -> Result<(), BufferError> {
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    handle
        .write_all(buf.as_bytes())
        .map_err(BufferError::io("writing offset file", path))
}
