use crate::error::TrainingResult;
use crate::job::TrainingJobId;
use std::path::{Path, PathBuf};

/// Marker present inside a job directory until provisioning has finished.
pub const PROVISIONING_MARKER: &str = ".provisioning";

/// Filesystem layout under the configured storage root.
///
/// ```text
/// <storage>/train.lock
/// <storage>/validate.json
/// <storage>/dataset/
/// <storage>/train/train.log
/// <storage>/train/train.json
/// <storage>/train/<job_id>/{dataset/,weights/,dataset.cfg,network.cfg,names.txt,starting.weights}
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// A relative root is anchored at the current directory, so every path
    /// handed to a job stays valid whatever directory that job runs in.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn training_lock(&self) -> PathBuf {
        self.root.join("train.lock")
    }

    #[must_use]
    pub fn training_root(&self) -> PathBuf {
        self.root.join("train")
    }

    #[must_use]
    pub fn training_log(&self) -> PathBuf {
        self.training_root().join("train.log")
    }

    #[must_use]
    pub fn progress_snapshot(&self) -> PathBuf {
        self.training_root().join("train.json")
    }

    #[must_use]
    pub fn accuracy_index(&self) -> PathBuf {
        self.root.join("validate.json")
    }

    #[must_use]
    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join("dataset")
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &TrainingJobId) -> PathBuf {
        self.training_root().join(job_id.0.as_str())
    }

    /// Storage-relative form of `path`, used as a stable key in records.
    #[must_use]
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    pub fn ensure_training_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(self.training_root())?;
        Ok(())
    }
}
