//! The launched side: one training job or one checkpoint evaluation.
//!
//! Output is the detector's own, plus our logs on stderr. A held lock exits
//! with `EXIT_BUSY` so the supervising process can tell it from a failure.

use super::CommandStatus;
use anyhow::Context;
use tracing::info;
use umbra_training::{AppConfig, DarknetCli, TrainingRequest, TrainingResult, run_training, run_validation};

async fn blocking<T, F>(work: F) -> anyhow::Result<TrainingResult<T>>
where
    T: Send + 'static,
    F: FnOnce() -> TrainingResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.context("job task panicked")
}

pub async fn train(config: &AppConfig, request: TrainingRequest) -> anyhow::Result<CommandStatus> {
    let layout = config.layout();
    let backend = DarknetCli::new(config.darknet.clone());

    match blocking(move || run_training(&layout, &request, &backend)).await? {
        Ok(job) => {
            info!(job_id = %job.id, "training job complete");
            Ok(CommandStatus::Done)
        }
        Err(e) if e.is_busy() => Ok(CommandStatus::Busy),
        Err(e) => Err(anyhow::Error::new(e).context("training failed")),
    }
}

pub async fn validate(config: &AppConfig, request: TrainingRequest) -> anyhow::Result<CommandStatus> {
    let backend = DarknetCli::new(config.darknet.clone());

    blocking(move || run_validation(&request, None, &backend))
        .await?
        .context("validation failed")?;
    Ok(CommandStatus::Done)
}
