use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobId;
use crate::layout::{StorageLayout, PROVISIONING_MARKER};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A saved weights file produced by a training job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Storage-relative path, used as the accuracy index key.
    pub key: String,
    pub weights: PathBuf,
    /// The job directory the weights belong to.
    pub job_dir: PathBuf,
}

impl Checkpoint {
    #[must_use]
    pub fn data_file(&self) -> PathBuf {
        self.job_dir.join("dataset.cfg")
    }

    #[must_use]
    pub fn network_file(&self) -> PathBuf {
        self.job_dir.join("network.cfg")
    }
}

fn is_complete_job(dir: &Path) -> bool {
    dir.is_dir() && !dir.join(PROVISIONING_MARKER).exists()
}

/// Find `train/*/weights/*.weights` in discovery (lexicographic) order.
pub fn discover_checkpoints(layout: &StorageLayout) -> TrainingResult<Vec<Checkpoint>> {
    let root = glob::Pattern::escape(&layout.training_root().to_string_lossy());
    let pattern = Path::new(&root).join("*").join("weights").join("*.weights");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern)
        .map_err(|e| TrainingError::Other(anyhow::anyhow!("invalid checkpoint pattern {pattern}: {e}")))?;

    let mut out = Vec::new();
    for entry in paths {
        let weights = entry.map_err(|e| TrainingError::Io(e.into_error()))?;
        let Some(job_dir) = weights.parent().and_then(Path::parent) else {
            continue;
        };
        if !is_complete_job(job_dir) {
            tracing::debug!(path = %weights.display(), "skipping checkpoint of incomplete job");
            continue;
        }
        out.push(Checkpoint { key: layout.relative(&weights), job_dir: job_dir.to_path_buf(), weights });
    }
    Ok(out)
}

/// Ids of fully provisioned jobs, sorted by name.
pub fn discover_jobs(layout: &StorageLayout) -> TrainingResult<Vec<TrainingJobId>> {
    let dir = match std::fs::read_dir(layout.training_root()) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    for entry in dir {
        let entry = entry?;
        if is_complete_job(&entry.path()) {
            out.push(TrainingJobId(entry.file_name().to_string_lossy().into_owned()));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Most recently modified directory under the training root, as a storage-relative path.
pub fn latest_job_dir(layout: &StorageLayout) -> TrainingResult<Option<String>> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(layout.training_root())? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_dir() {
            continue;
        }
        let modified = metadata.modified()?;
        if latest.as_ref().is_none_or(|(t, _)| modified >= *t) {
            latest = Some((modified, entry.path()));
        }
    }
    Ok(latest.map(|(_, path)| layout.relative(&path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn job_with_weights(layout: &StorageLayout, id: &str, weights: &[&str]) -> PathBuf {
        let dir = layout.training_root().join(id);
        fs::create_dir_all(dir.join("weights")).unwrap();
        for w in weights {
            fs::write(dir.join("weights").join(w), b"w").unwrap();
        }
        dir
    }

    #[test]
    fn test_discover_checkpoints_in_order() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().to_path_buf());
        job_with_weights(&layout, "02012024_000000", &["net_1000.weights", "net_final.weights", "notes.txt"]);
        job_with_weights(&layout, "01012024_000000", &["net_last.weights"]);

        let found = discover_checkpoints(&layout).unwrap();
        let keys: Vec<_> = found.iter().map(|c| c.key.clone()).collect();
        let expected: Vec<String> = [
            "train/01012024_000000/weights/net_last.weights",
            "train/02012024_000000/weights/net_1000.weights",
            "train/02012024_000000/weights/net_final.weights",
        ]
        .iter()
        .map(|p| Path::new(p).to_string_lossy().into_owned())
        .collect();
        assert_eq!(keys, expected);
        assert_eq!(found[0].data_file(), layout.training_root().join("01012024_000000").join("dataset.cfg"));
    }

    #[cfg(unix)]
    #[test]
    fn test_storage_root_with_glob_characters() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().join("runs [v2] *?"));
        job_with_weights(&layout, "01012024_000000", &["net_final.weights"]);

        let found = discover_checkpoints(&layout).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].weights, layout.training_root().join("01012024_000000/weights/net_final.weights"));
    }

    #[test]
    fn test_incomplete_jobs_are_skipped() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().to_path_buf());
        job_with_weights(&layout, "done", &["a.weights"]);
        let pending = job_with_weights(&layout, "pending", &["b.weights"]);
        fs::write(pending.join(PROVISIONING_MARKER), b"").unwrap();
        fs::write(layout.training_log(), b"log").unwrap();

        assert_eq!(discover_checkpoints(&layout).unwrap().len(), 1);
        assert_eq!(discover_jobs(&layout).unwrap(), vec![TrainingJobId("done".to_string())]);
    }

    #[test]
    fn test_discover_jobs_without_training_root() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().to_path_buf());
        assert!(discover_jobs(&layout).unwrap().is_empty());
        assert!(discover_checkpoints(&layout).unwrap().is_empty());
    }

    #[test]
    fn test_latest_job_dir_ignores_files() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().to_path_buf());
        job_with_weights(&layout, "only", &[]);
        fs::write(layout.progress_snapshot(), b"{}").unwrap();

        let latest = latest_job_dir(&layout).unwrap();
        assert_eq!(latest, Some(Path::new("train/only").to_string_lossy().into_owned()));
    }
}
