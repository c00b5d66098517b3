//! Durable JSON records read by status callers.
//!
//! Every write goes to a temporary file in the destination directory and is
//! then renamed over the target, so a reader sees either the previous file or
//! the complete new one.

use crate::accuracy::AccuracyIndex;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::StorageLayout;
use crate::progress::ProgressSnapshot;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{ErrorKind, Write};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct RecordStore {
    layout: StorageLayout,
}

impl RecordStore {
    #[must_use]
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn write_progress(&self, snapshot: &ProgressSnapshot) -> TrainingResult<()> {
        write_json_atomic(&self.layout.progress_snapshot(), snapshot)
    }

    /// `None` until the first progress line of the current job has been flushed.
    pub fn read_progress(&self) -> TrainingResult<Option<ProgressSnapshot>> {
        read_json_optional(&self.layout.progress_snapshot())
    }

    pub fn clear_progress(&self) -> TrainingResult<()> {
        match std::fs::remove_file(self.layout.progress_snapshot()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the whole index.
    pub fn write_index(&self, index: &AccuracyIndex) -> TrainingResult<()> {
        write_json_atomic(&self.layout.accuracy_index(), index)
    }

    pub fn read_index(&self) -> TrainingResult<AccuracyIndex> {
        let path = self.layout.accuracy_index();
        read_json_optional(&path)?.ok_or(TrainingError::AccuracyIndexMissing(path))
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| TrainingError::Io(e.error))?;
    Ok(())
}

fn read_json_optional<T: DeserializeOwned>(path: &Path) -> TrainingResult<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
