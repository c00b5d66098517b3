//! Batch evaluation of every checkpoint under the training root.

use crate::accuracy::{AccuracyIndex, AccuracyParser, AccuracyReport};
use crate::error::{LockKind, TrainingError, TrainingResult};
use crate::layout::StorageLayout;
use crate::lock::ValidationGuard;
use crate::registry::{self, Checkpoint};
use crate::store::RecordStore;
use crate::supervisor::{JobLauncher, LaunchSpec};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs one validation batch at a time; a concurrent batch is turned away.
pub struct ValidationOrchestrator {
    layout: StorageLayout,
    launcher: Arc<dyn JobLauncher>,
    store: RecordStore,
    guard: ValidationGuard,
}

impl ValidationOrchestrator {
    #[must_use]
    pub fn new(layout: StorageLayout, launcher: Arc<dyn JobLauncher>) -> Self {
        let store = RecordStore::new(layout.clone());
        Self { layout, launcher, store, guard: ValidationGuard::new() }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.guard.is_held()
    }

    /// Evaluate all checkpoints in discovery order and replace the stored index.
    ///
    /// Returns [`TrainingError::Busy`] when another batch is running. Any
    /// launch or child failure aborts the batch and leaves the previous index
    /// in place.
    pub async fn run_batch(&self) -> TrainingResult<AccuracyIndex> {
        let Some(_permit) = self.guard.try_enter() else {
            info!("validation batch already running");
            return Err(TrainingError::Busy(LockKind::Validation));
        };

        let checkpoints = registry::discover_checkpoints(&self.layout)?;
        info!(count = checkpoints.len(), "validating checkpoints");

        let mut index = AccuracyIndex::new();
        for checkpoint in &checkpoints {
            let report = self.evaluate(checkpoint).await?;
            index.insert(checkpoint.key.clone(), report);
        }

        self.store.write_index(&index)?;
        info!(path = %self.layout.accuracy_index().display(), count = index.len(), "accuracy index written");
        Ok(index)
    }

    async fn evaluate(&self, checkpoint: &Checkpoint) -> TrainingResult<AccuracyReport> {
        debug!(checkpoint = %checkpoint.key, "evaluating");
        let spec = LaunchSpec::validation(self.layout.root(), checkpoint);
        let lines = self.launcher.launch(&spec)?.run_to_end().await?;

        let mut parser = AccuracyParser::default();
        for line in &lines {
            parser.feed(line);
        }
        if !parser.mismatches().is_empty() {
            debug!(checkpoint = %checkpoint.key, count = parser.mismatches().len(), "validation lines ignored");
        }
        Ok(parser.finish())
    }
}
