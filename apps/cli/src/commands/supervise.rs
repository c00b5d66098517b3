//! Start, status, evaluate and accuracy: the operations backed by `TrainingService`.

use super::{CommandStatus, print_json};
use anyhow::Context;
use serde_json::json;
use tracing::info;
use umbra_training::{AppConfig, BatchOutcome, StartOutcome, TrainingRequest, TrainingService};

fn service(config: &AppConfig) -> anyhow::Result<TrainingService> {
    TrainingService::from_config(config).context("failed to set up the training service")
}

fn print_busy() -> anyhow::Result<CommandStatus> {
    print_json(&json!({ "state": "busy" }))?;
    Ok(CommandStatus::Busy)
}

/// Start training, then stay attached until the job ends and print its final status.
pub async fn start(config: &AppConfig, request: TrainingRequest) -> anyhow::Result<CommandStatus> {
    let service = service(config)?;

    match service.start_training(request).await.context("failed to start training")? {
        StartOutcome::Busy => print_busy(),
        StartOutcome::Accepted(handle) => {
            info!(storage = %config.storage.display(), "training accepted");
            handle.wait().await.context("training job failed")?;
            print_json(&service.training_status().await?)?;
            Ok(CommandStatus::Done)
        }
    }
}

pub async fn status(config: &AppConfig) -> anyhow::Result<CommandStatus> {
    let status = service(config)?.training_status().await.context("failed to read training status")?;
    print_json(&status)?;
    Ok(CommandStatus::Done)
}

/// Run one validation batch. The busy guard lives in this process, so
/// `evaluate` invocations in separate processes do not see each other and
/// each one rewrites the index when it finishes.
pub async fn evaluate(config: &AppConfig) -> anyhow::Result<CommandStatus> {
    match service(config)?.run_validation_batch().await.context("validation batch failed")? {
        BatchOutcome::Completed(index) => {
            print_json(&index)?;
            Ok(CommandStatus::Done)
        }
        BatchOutcome::Busy => print_busy(),
    }
}

pub fn accuracy(config: &AppConfig) -> anyhow::Result<CommandStatus> {
    let index = service(config)?.accuracy_index()?;
    print_json(&index)?;
    Ok(CommandStatus::Done)
}
