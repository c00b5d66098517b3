use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJob;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The detector implementation that actually trains and evaluates.
///
/// Implementations write their progress to the inherited stdout/stderr; the
/// launcher decides where that ends up.
pub trait DetectorBackend: Send + Sync {
    fn id(&self) -> &'static str;

    fn train(&self, job: &TrainingJob, clear: bool) -> TrainingResult<()>;

    /// Evaluate `weights`. Relative paths inside `data` resolve against `cwd` when given.
    fn validate(&self, data: &Path, config: &Path, weights: &Path, cwd: Option<&Path>) -> TrainingResult<()>;
}

/// Drives the `darknet` executable.
#[derive(Debug, Clone)]
pub struct DarknetCli {
    executable: PathBuf,
}

impl DarknetCli {
    #[must_use]
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    /// `detector train <data> <cfg> [<weights>] -dont_show -map [-clear]`
    #[must_use]
    pub fn train_args(job: &TrainingJob, clear: bool) -> Vec<String> {
        let mut args = vec![
            "detector".to_string(),
            "train".to_string(),
            job.data_file.to_string_lossy().into_owned(),
            job.network_file.to_string_lossy().into_owned(),
        ];
        if let Some(weights) = &job.starting_weights {
            args.push(weights.to_string_lossy().into_owned());
        }
        args.extend(["-dont_show".to_string(), "-map".to_string()]);
        if clear {
            args.push("-clear".to_string());
        }
        args
    }

    /// `detector map <data> <cfg> <weights>`
    #[must_use]
    pub fn validate_args(data: &Path, config: &Path, weights: &Path) -> Vec<String> {
        vec![
            "detector".to_string(),
            "map".to_string(),
            data.to_string_lossy().into_owned(),
            config.to_string_lossy().into_owned(),
            weights.to_string_lossy().into_owned(),
        ]
    }

    fn run(&self, args: &[String], cwd: Option<&Path>) -> TrainingResult<()> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        tracing::debug!(program = %self.executable.display(), ?args, "running detector");

        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(TrainingError::ChildProcess { program: self.executable.display().to_string(), code: status.code() })
        }
    }
}

impl DetectorBackend for DarknetCli {
    fn id(&self) -> &'static str {
        "darknet"
    }

    fn train(&self, job: &TrainingJob, clear: bool) -> TrainingResult<()> {
        self.run(&Self::train_args(job, clear), Some(&job.root))
    }

    fn validate(&self, data: &Path, config: &Path, weights: &Path, cwd: Option<&Path>) -> TrainingResult<()> {
        self.run(&Self::validate_args(data, config, weights), cwd)
    }
}
