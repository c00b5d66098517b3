//! Umbra Training
//!
//! Supervision of darknet detector training and validation runs:
//! - Provisioning per-job workspaces under a storage root (`WorkspaceProvisioner`)
//! - Launching jobs as child processes or in-process (`JobLauncher`)
//! - Parsing progress and accuracy output into JSON records (`ProgressParser`, `AccuracyParser`)
//! - Serialising training and validation through locks (`FileLock`, `ValidationGuard`)
//! - The start/status/validate/accuracy operations (`TrainingService`)

pub mod accuracy;
pub mod backend;
pub mod capture;
pub mod config;
pub mod dataset;
pub mod error;
pub mod grammar;
pub mod job;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod validation;
pub mod workspace;

pub use accuracy::{AccuracyIndex, AccuracyParser, AccuracyReport, ClassAccuracy};
pub use backend::{DarknetCli, DetectorBackend};
pub use config::{AppConfig, ExecutionMode, StatusConfig};
pub use dataset::{DatasetWriter, Label, LabelledSample, Split, SplitBalancer, read_label_file};
pub use error::{EXIT_BUSY, LockKind, TrainingError, TrainingResult};
pub use job::{TrainingJob, TrainingJobId, TrainingRequest};
pub use layout::StorageLayout;
pub use lock::{ExclusivityLock, FileLock, ValidationGuard};
pub use manifest::{DataKey, DataManifest};
pub use progress::{LineOutcome, ParserState, ProgressParser, ProgressSnapshot};
pub use registry::{Checkpoint, discover_checkpoints, discover_jobs, latest_job_dir};
pub use runner::{InProcessLauncher, run_training, run_validation};
pub use service::{BatchOutcome, StartOutcome, TrainingService, TrainingStatus};
pub use store::RecordStore;
pub use supervisor::{JobCommand, JobCompletion, JobLauncher, LaunchSpec, LineSplit, LineStream, ProcessLauncher, SupervisedJob};
pub use telemetry::{FirstSample, TrainingHandle};
pub use validation::ValidationOrchestrator;
pub use workspace::WorkspaceProvisioner;
