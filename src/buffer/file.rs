use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use tracing::debug;

use super::BufferError;

/// Extension shared by data and offset files.
pub const FILE_SUFFIX: &str = ".sw";

/// Name of the empty file used for directory exclusivity.
pub const LOCK_FILE: &str = "lock";

/// The two families of rolling files kept in a buffer directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Length-prefixed segment records.
    Data,
    /// Newline-separated cursor snapshots.
    Offset,
}

impl FileKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Data => "data_",
            Self::Offset => "offset_",
        }
    }

    /// Builds the file name for a creation timestamp in milliseconds.
    pub fn file_name(self, timestamp_ms: u64) -> String {
        format!("{}{}{}", self.prefix(), timestamp_ms, FILE_SUFFIX)
    }

    /// Extracts the creation timestamp from a file name of this kind.
    pub fn timestamp(self, name: &str) -> Option<u64> {
        name.strip_prefix(self.prefix())?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }
}

/// Creates the buffer directory if it does not exist yet.
pub fn ensure_dir(dir: &Path) -> Result<(), BufferError> {
    fs::create_dir_all(dir).map_err(|source| BufferError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Lists files of one kind ordered by creation timestamp (oldest first).
pub fn list(dir: &Path, kind: FileKind) -> Result<Vec<(u64, String)>, BufferError> {
    let entries = fs::read_dir(dir).map_err(BufferError::io("listing", dir))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BufferError::io("listing", dir))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if let Some(ts) = kind.timestamp(&name) {
            files.push((ts, name));
        }
    }
    files.sort_unstable();

    Ok(files)
}

/// Returns the oldest file of one kind, if any.
pub fn oldest(dir: &Path, kind: FileKind) -> Result<Option<String>, BufferError> {
    Ok(list(dir, kind)?.into_iter().next().map(|(_, name)| name))
}

/// Returns true when `a` was created strictly before `b`.
///
/// Names that do not parse never compare as older.
pub fn is_older(kind: FileKind, a: &str, b: &str) -> bool {
    match (kind.timestamp(a), kind.timestamp(b)) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// Creates a new, empty file whose name sorts after every existing file of
/// the same kind, even if the wall clock went backwards.
pub fn create(dir: &Path, kind: FileKind) -> Result<(String, File), BufferError> {
    let newest = list(dir, kind)?.last().map(|(ts, _)| *ts);
    let now = now_ms();
    let mut ts = match newest {
        Some(newest) if newest >= now => newest + 1,
        _ => now,
    };

    loop {
        let name = kind.file_name(ts);
        let path = dir.join(&name);
        match OpenOptions::new()
            .append(true)
            .read(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                debug!(file = %name, "created buffer file");
                return Ok((name, file));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => ts += 1,
            Err(e) => return Err(BufferError::io("creating", &path)(e)),
        }
    }
}

/// Deletes one buffer file. A file that is already gone is not an error.
pub fn remove(dir: &Path, name: &str) -> Result<(), BufferError> {
    let path = dir.join(name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BufferError::io("deleting", &path)(e)),
    }
}

/// Deletes every data and offset file, returning how many were removed.
pub fn clean(dir: &Path) -> Result<usize, BufferError> {
    let mut removed = 0;
    for kind in [FileKind::Data, FileKind::Offset] {
        for (_, name) in list(dir, kind)? {
            remove(dir, &name)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Exclusive advisory lock over a buffer directory.
///
/// The lock is advisory: it only keeps out other processes that also take
/// it. It is released when the value is dropped.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Takes the lock without blocking.
    pub fn acquire(dir: &Path) -> Result<Self, BufferError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(BufferError::io("opening lock file", &path))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "acquired buffer directory lock");
                Ok(Self { _file: file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_lock_contended(&e) => {
                Err(BufferError::Locked {
                    path: dir.to_path_buf(),
                })
            }
            Err(e) => Err(BufferError::io("locking", &path)(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_lock_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
