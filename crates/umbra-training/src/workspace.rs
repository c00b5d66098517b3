//! Per-job workspace provisioning.
//!
//! Every training launch gets its own timestamp-named directory under
//! `<storage>/train/`. The dataset lists are rewritten into the job directory
//! and the referenced images/labels are hardlinked next to them, so the
//! original dataset files are never touched.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingJob, TrainingJobId};
use crate::layout::{StorageLayout, PROVISIONING_MARKER};
use crate::manifest::{DataKey, DataManifest};
use chrono::Local;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix of the line announcing a freshly created job directory.
pub const SESSION_CREATED_MARKER: &str = "creating a new training session";

const MAX_ID_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    layout: StorageLayout,
}

impl WorkspaceProvisioner {
    #[must_use]
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Create a uniquely named job directory with `dataset/` and `weights/`.
    ///
    /// The directory carries the provisioning marker until [`Self::provision`]
    /// completes. Returns the id, job root and dataset directory.
    pub fn create_layout(&self) -> TrainingResult<(TrainingJobId, PathBuf, PathBuf)> {
        self.layout.ensure_training_root()?;
        let base = TrainingJobId::from_timestamp(Local::now());

        let mut created = None;
        for attempt in 0..MAX_ID_ATTEMPTS {
            let id = base.with_suffix(attempt);
            let dir = self.layout.job_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    created = Some((id, dir));
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(job_id = %id, "job directory exists, trying next suffix");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let (id, dir) = created.ok_or_else(|| {
            TrainingError::Other(anyhow::anyhow!("no free job directory name for {base}"))
        })?;

        let root = std::path::absolute(&dir)?;
        fs::write(root.join(PROVISIONING_MARKER), b"")?;
        info!("{SESSION_CREATED_MARKER} @ {}", root.display());

        let dataset_dir = root.join("dataset");
        fs::create_dir_all(&dataset_dir)?;
        fs::create_dir_all(root.join("weights"))?;
        Ok((id, root, dataset_dir))
    }

    /// Build a complete job workspace.
    ///
    /// `manifest` is updated in place (split lists, names, backup directory)
    /// before being written as the job's `dataset.cfg`. On failure the job
    /// directory is removed; if that fails too, the marker keeps it out of
    /// every listing.
    pub fn provision(
        &self,
        manifest: &mut DataManifest,
        network_config: &Path,
        starting_weights: Option<&Path>,
    ) -> TrainingResult<TrainingJob> {
        let (id, root, dataset_dir) = self.create_layout()?;

        match self.populate(manifest, network_config, starting_weights, &id, &root, &dataset_dir) {
            Ok(job) => {
                fs::remove_file(root.join(PROVISIONING_MARKER))?;
                info!(job_id = %job.id, "training workspace ready");
                Ok(job)
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "provisioning failed, discarding workspace");
                if let Err(cleanup) = fs::remove_dir_all(&root) {
                    warn!(path = %root.display(), error = %cleanup, "could not remove incomplete workspace");
                }
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        manifest: &mut DataManifest,
        network_config: &Path,
        starting_weights: Option<&Path>,
        id: &TrainingJobId,
        root: &Path,
        dataset_dir: &Path,
    ) -> TrainingResult<TrainingJob> {
        for key in [DataKey::Train, DataKey::Valid] {
            if let Some(list) = manifest.get(&key) {
                let list_name = self.link_split(&key, Path::new(&list), root, dataset_dir)?;
                manifest.set(key, list_name);
            }
        }

        let names_file = match manifest.get(&DataKey::Names) {
            Some(names) => {
                let dst = root.join("names.txt");
                debug!(from = %names, to = %dst.display(), "copying class names");
                fs::copy(&names, &dst)?;
                manifest.set(DataKey::Names, "names.txt");
                Some(dst)
            }
            None => None,
        };

        manifest.set(DataKey::Backup, "weights");

        let data_file = root.join("dataset.cfg");
        debug!(path = %data_file.display(), "writing data manifest");
        manifest.write_file(&data_file)?;

        let network_file = root.join("network.cfg");
        fs::copy(network_config, &network_file)?;

        let starting_weights = match starting_weights {
            Some(src) => {
                let dst = root.join("starting.weights");
                debug!(from = %src.display(), to = %dst.display(), "copying starting weights");
                fs::copy(src, &dst)?;
                Some(dst)
            }
            None => None,
        };

        Ok(TrainingJob {
            id: id.clone(),
            root: root.to_path_buf(),
            dataset_dir: dataset_dir.to_path_buf(),
            weights_dir: root.join("weights"),
            data_file,
            network_file,
            starting_weights,
            names_file,
        })
    }

    /// Rewrite one split list into the job, linking each image and its label.
    /// Returns the list's job-relative name.
    fn link_split(&self, key: &DataKey, source: &Path, root: &Path, dataset_dir: &Path) -> TrainingResult<String> {
        let list_name = format!("{key}.txt");
        let contents = fs::read_to_string(source)?;
        let mut rewritten = String::new();

        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let image = if Path::new(line).is_absolute() {
                PathBuf::from(line)
            } else {
                self.layout.root().join(line)
            };
            let label = image.with_extension("txt");

            for src in [&image, &label] {
                let name = src.file_name().ok_or_else(|| {
                    TrainingError::Manifest(format!("{} entry has no file name: {line}", key))
                })?;
                link_or_copy(src, &dataset_dir.join(name))?;
            }

            if let Some(name) = image.file_name() {
                rewritten.push_str(&Path::new("dataset").join(name).to_string_lossy());
                rewritten.push('\n');
            }
        }

        let list_path = root.join(&list_name);
        debug!(path = %list_path.display(), "writing dataset list");
        fs::write(&list_path, rewritten)?;
        Ok(list_name)
    }
}

/// Hardlink `src` to `dst`, copying when a link cannot be made. An existing
/// `dst` is accepted only when it holds the same file, which happens when an
/// entry is listed more than once.
fn link_or_copy(src: &Path, dst: &Path) -> TrainingResult<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if same_file(src, dst)? {
                return Ok(());
            }
            let name = dst.file_name().unwrap_or_default().to_string_lossy();
            Err(TrainingError::Manifest(format!(
                "{} and another dataset entry share the file name {name}",
                src.display()
            )))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e.into()),
        Err(e) => {
            debug!(from = %src.display(), error = %e, "hardlink failed, copying instead");
            fs::copy(src, dst)?;
            Ok(())
        }
    }
}

fn same_file(a: &Path, b: &Path) -> TrainingResult<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino() {
            return Ok(true);
        }
    }
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}
