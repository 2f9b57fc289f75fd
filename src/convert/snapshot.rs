//! Debug snapshots of the synthesized document.
//!
//! A sink is handed to each conversion explicitly. The file sink writes to
//! one fixed path that every conversion overwrites: concurrent conversions
//! race on it and the last write survives. No ordering is promised.

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the file snapshot.
pub const DEFAULT_SNAPSHOT_PATH: &str = "/tmp/debug.html";

/// Receives the synthesized markup of a conversion.
pub trait SnapshotSink: Send + Sync {
    /// Store `markup`, replacing any previous snapshot.
    fn write(&self, markup: &str) -> io::Result<()>;
}

/// Metadata and preview of an existing snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Size in bytes.
    pub size: u64,
    /// Leading characters of the snapshot.
    pub preview: String,
}

/// Snapshot written to a single well-known file.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
}

impl Default for FileSnapshot {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_PATH)
    }
}

impl FileSnapshot {
    /// Create a sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current snapshot; `Ok(None)` when none was written yet.
    pub fn read(&self) -> io::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(markup) => Ok(Some(markup)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Size and preview of the current snapshot; `Ok(None)` when absent.
    pub fn inspect(&self, preview_chars: usize) -> io::Result<Option<SnapshotInfo>> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(markup) = self.read()? else {
            return Ok(None);
        };
        Ok(Some(SnapshotInfo {
            size,
            preview: markup.chars().take(preview_chars).collect(),
        }))
    }
}

impl SnapshotSink for FileSnapshot {
    fn write(&self, markup: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, markup)
    }
}

/// Snapshot kept in memory, scoped to whoever owns the sink.
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    markup: Mutex<Option<String>>,
}

impl MemorySnapshot {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written snapshot.
    pub fn get(&self) -> Option<String> {
        self.markup.lock().clone()
    }
}

impl SnapshotSink for MemorySnapshot {
    fn write(&self, markup: &str) -> io::Result<()> {
        *self.markup.lock() = Some(markup.to_string());
        Ok(())
    }
}
