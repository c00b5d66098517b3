//! Typed operations behind the start/status/validate/accuracy calls.

use crate::accuracy::AccuracyIndex;
use crate::backend::{DarknetCli, DetectorBackend};
use crate::config::{AppConfig, ExecutionMode, StatusConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingRequest;
use crate::layout::StorageLayout;
use crate::lock::{ExclusivityLock, FileLock};
use crate::progress::ProgressSnapshot;
use crate::runner::InProcessLauncher;
use crate::store::RecordStore;
use crate::supervisor::{JobLauncher, LaunchSpec, ProcessLauncher};
use crate::telemetry::{self, FirstSample, TrainingHandle};
use crate::validation::ValidationOrchestrator;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
pub enum StartOutcome {
    /// The job reported progress (or finished cleanly) and keeps running in the background.
    Accepted(TrainingHandle),
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingStatus {
    Running(ProgressSnapshot),
    /// No job holds the lock. `last` is the final snapshot of the previous job, if any.
    NotRunning { last: Option<ProgressSnapshot> },
    NotReadyYet { retry_after_secs: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed(AccuracyIndex),
    Busy,
}

pub struct TrainingService {
    layout: StorageLayout,
    store: RecordStore,
    defaults: TrainingRequest,
    status: StatusConfig,
    launcher: Arc<dyn JobLauncher>,
    // Serialises start calls inside this process until the launched job owns the file lock.
    start_gate: Mutex<()>,
    validation: ValidationOrchestrator,
}

impl TrainingService {
    #[must_use]
    pub fn new(config: &AppConfig, launcher: Arc<dyn JobLauncher>) -> Self {
        let layout = config.layout();
        Self {
            store: RecordStore::new(layout.clone()),
            defaults: config.default_request(),
            status: config.status.clone(),
            validation: ValidationOrchestrator::new(layout.clone(), Arc::clone(&launcher)),
            launcher,
            layout,
            start_gate: Mutex::new(()),
        }
    }

    /// Wire the launcher the configured execution mode asks for.
    pub fn from_config(config: &AppConfig) -> TrainingResult<Self> {
        let launcher: Arc<dyn JobLauncher> = match config.execution_mode {
            // The re-executed binary resolves its own config; pin the detector it runs.
            ExecutionMode::Subprocess => Arc::new(ProcessLauncher::current_exe()?.with_env("UMBRA_DARKNET", &config.darknet)),
            ExecutionMode::InProcess => {
                let backend: Arc<dyn DetectorBackend> = Arc::new(DarknetCli::new(config.darknet.clone()));
                Arc::new(InProcessLauncher::new(backend))
            }
        };
        Ok(Self::new(config, launcher))
    }

    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn training_lock(&self) -> FileLock {
        FileLock::new(self.layout.training_lock())
    }

    /// Launch a training job and wait for its first progress sample.
    pub async fn start_training(&self, request: TrainingRequest) -> TrainingResult<StartOutcome> {
        let Ok(_gate) = self.start_gate.try_lock() else {
            debug!("start already in progress");
            return Ok(StartOutcome::Busy);
        };
        let request = request.or_defaults(&self.defaults);
        {
            // Records are only reset under the lock. The launched job takes it for real.
            let lock = self.training_lock();
            let Some(_reset) = lock.try_guard()? else {
                info!("training already running");
                return Ok(StartOutcome::Busy);
            };
            request.validate()?;

            self.layout.ensure_training_root()?;
            self.store.clear_progress()?;
            std::fs::File::create(self.layout.training_log())?;
        }

        let spec = LaunchSpec::training(self.layout.root(), request);
        let job = self.launcher.launch(&spec)?;
        let (handle, first) = telemetry::spawn_progress_worker(job, self.layout.clone(), self.store.clone());

        match first.await {
            Ok(FirstSample::Ready | FirstSample::Finished(Ok(()))) => Ok(StartOutcome::Accepted(handle)),
            Ok(FirstSample::Finished(Err(e))) if e.is_busy_outcome() => Ok(StartOutcome::Busy),
            Ok(FirstSample::Finished(Err(e)) | FirstSample::Failed(e)) => Err(e),
            Err(_) => {
                handle.wait().await?;
                Err(TrainingError::Other(anyhow::anyhow!("telemetry worker stopped before reporting")))
            }
        }
    }

    /// Current progress, polling briefly while a freshly started job has not reported yet.
    pub async fn training_status(&self) -> TrainingResult<TrainingStatus> {
        if !self.training_lock().is_held()? {
            return Ok(TrainingStatus::NotRunning { last: self.store.read_progress()? });
        }

        for attempt in 1..=self.status.retries {
            if let Some(progress) = self.store.read_progress()? {
                return Ok(TrainingStatus::Running(progress));
            }
            if attempt < self.status.retries {
                tokio::time::sleep(self.status.retry_delay()).await;
            }
        }
        Ok(TrainingStatus::NotReadyYet { retry_after_secs: self.status.retry_after_secs })
    }

    pub async fn run_validation_batch(&self) -> TrainingResult<BatchOutcome> {
        match self.validation.run_batch().await {
            Ok(index) => Ok(BatchOutcome::Completed(index)),
            Err(e) if e.is_busy() => Ok(BatchOutcome::Busy),
            Err(e) => Err(e),
        }
    }

    pub fn accuracy_index(&self) -> TrainingResult<AccuracyIndex> {
        self.store.read_index()
    }
}
