//! Application state shared across handlers.

use crate::config::Config;
use crate::convert::{Converter, FileSnapshot, SnapshotInfo, SnapshotSink};
use crate::error::{AppError, Result};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Conversion pipeline.
    pub converter: Arc<Converter>,
    /// Debug snapshot file, when enabled.
    snapshot: Option<Arc<FileSnapshot>>,
}

impl AppState {
    /// Create application state from configuration.
    pub fn new(config: Config) -> Self {
        let converter = Converter::new(&config.convert);
        let snapshot = config
            .debug
            .snapshot
            .then(|| Arc::new(FileSnapshot::new(&config.debug.snapshot_path)));

        Self {
            config: Arc::new(config),
            converter: Arc::new(converter),
            snapshot,
        }
    }

    /// Whether conversions keep a debug snapshot.
    pub fn snapshot_enabled(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Size and preview of the snapshot, read on the blocking pool.
    /// `None` when disabled or nothing has been converted yet.
    pub async fn snapshot_info(&self, preview_chars: usize) -> Result<Option<SnapshotInfo>> {
        self.with_snapshot(move |snapshot| snapshot.inspect(preview_chars))
            .await
            .map(Option::flatten)
    }

    /// Snapshot markup, read on the blocking pool.
    pub async fn snapshot_markup(&self) -> Result<Option<String>> {
        self.with_snapshot(FileSnapshot::read)
            .await
            .map(Option::flatten)
    }

    async fn with_snapshot<T, F>(&self, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&FileSnapshot) -> std::io::Result<T> + Send + 'static,
    {
        let Some(snapshot) = self.snapshot.clone() else {
            return Ok(None);
        };
        let value = tokio::task::spawn_blocking(move || f(snapshot.as_ref()))
            .await
            .map_err(|e| AppError::Internal(format!("Snapshot task failed: {}", e)))??;
        Ok(Some(value))
    }

    /// Convert an uploaded EPUB on the blocking pool.
    pub async fn convert(&self, epub: Vec<u8>) -> Result<Vec<u8>> {
        let converter = Arc::clone(&self.converter);
        let snapshot = self.snapshot.clone();

        let pdf = tokio::task::spawn_blocking(move || {
            let sink = snapshot.as_deref().map(|s| s as &dyn SnapshotSink);
            converter.convert(&epub, sink)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Conversion task failed: {}", e)))??;

        Ok(pdf)
    }
}
