//! The launched side of a job: what `umbra train` and `umbra validate` run.

use crate::backend::DetectorBackend;
use crate::capture;
use crate::error::{LockKind, TrainingError, TrainingResult};
use crate::job::{TrainingJob, TrainingRequest};
use crate::layout::StorageLayout;
use crate::lock::FileLock;
use crate::manifest::DataManifest;
use crate::supervisor::{JobCommand, JobLauncher, LaunchSpec, SupervisedJob};
use crate::workspace::WorkspaceProvisioner;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Take the training lock, provision a workspace, and train in it.
///
/// The lock is released on every exit path, and by the OS if this process dies.
pub fn run_training(
    layout: &StorageLayout,
    request: &TrainingRequest,
    backend: &dyn DetectorBackend,
) -> TrainingResult<TrainingJob> {
    request.validate()?;

    let lock = FileLock::new(layout.training_lock());
    let Some(_guard) = lock.try_guard()? else {
        info!(path = %lock.path().display(), "training lock held elsewhere");
        return Err(TrainingError::Busy(LockKind::Training));
    };

    let (Some(data), Some(config)) = (&request.data, &request.config) else {
        return Err(TrainingError::InvalidRequest("data and config are required".to_string()));
    };
    let mut manifest = DataManifest::read_file(data)?;
    let job = WorkspaceProvisioner::new(layout.clone()).provision(&mut manifest, config, request.weights.as_deref())?;

    info!(job_id = %job.id, backend = backend.id(), clear = request.clear, "starting training");
    backend.train(&job, request.clear)?;
    info!(job_id = %job.id, "training finished");
    Ok(job)
}

/// Evaluate a single checkpoint.
pub fn run_validation(request: &TrainingRequest, cwd: Option<&Path>, backend: &dyn DetectorBackend) -> TrainingResult<()> {
    request.validate()?;
    let (Some(data), Some(config), Some(weights)) = (&request.data, &request.config, &request.weights) else {
        return Err(TrainingError::InvalidRequest("validation needs data, config and weights".to_string()));
    };
    backend.validate(data, config, weights, cwd)
}

/// Runs jobs inside this process through [`capture::capture`] instead of re-executing.
#[derive(Clone)]
pub struct InProcessLauncher {
    backend: Arc<dyn DetectorBackend>,
}

impl InProcessLauncher {
    #[must_use]
    pub fn new(backend: Arc<dyn DetectorBackend>) -> Self {
        Self { backend }
    }
}

impl JobLauncher for InProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> TrainingResult<SupervisedJob> {
        let backend = Arc::clone(&self.backend);
        let layout = StorageLayout::new(spec.storage.clone());
        let command = spec.command.clone();
        let cwd = spec.cwd.clone();

        capture::capture(spec.split, move || match command {
            JobCommand::Train(request) => run_training(&layout, &request, backend.as_ref()).map(|_| ()),
            JobCommand::Validate(request) => run_validation(&request, cwd.as_deref(), backend.as_ref()),
        })
    }
}
