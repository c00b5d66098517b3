//! The worker attached to a live training job's output.
//!
//! One worker consumes one [`LineStream`] in order. Every line is appended to
//! the training log, fed to the [`ProgressParser`], and each parsed iteration
//! is flushed to the [`RecordStore`]. The launching caller waits on a one-shot
//! [`FirstSample`] that the worker fulfils at most once: after the first
//! iteration line, when a snapshot cannot be written, or when the stream ends
//! without either.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::StorageLayout;
use crate::progress::{LineOutcome, ProgressParser};
use crate::store::RecordStore;
use crate::supervisor::{JobCompletion, LineStream, SupervisedJob};
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What unblocked the launching caller.
#[derive(Debug)]
pub enum FirstSample {
    /// A progress snapshot is on disk.
    Ready,
    /// The job ended before reporting any progress.
    Finished(TrainingResult<()>),
    /// Progress could not be recorded. The job keeps running and its output is still drained.
    Failed(TrainingError),
}

/// Single-use sender; later fulfilments are ignored.
#[derive(Debug)]
struct Rendezvous {
    tx: Option<oneshot::Sender<FirstSample>>,
}

impl Rendezvous {
    fn fulfil(&mut self, sample: FirstSample) -> Option<FirstSample> {
        match self.tx.take() {
            Some(tx) => tx.send(sample).err(),
            None => Some(sample),
        }
    }
}

/// Handle to a training job running in the background.
#[derive(Debug)]
pub struct TrainingHandle {
    worker: JoinHandle<TrainingResult<()>>,
}

impl TrainingHandle {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait until the job's output is drained and the job has exited.
    pub async fn wait(self) -> TrainingResult<()> {
        self.worker
            .await
            .map_err(|e| TrainingError::Other(anyhow::anyhow!("telemetry worker failed: {e}")))?
    }
}

/// Start consuming `job`. The receiver resolves once, as described in the module docs.
pub fn spawn_progress_worker(
    job: SupervisedJob,
    layout: StorageLayout,
    store: RecordStore,
) -> (TrainingHandle, oneshot::Receiver<FirstSample>) {
    let (tx, rx) = oneshot::channel();
    let rendezvous = Rendezvous { tx: Some(tx) };
    let SupervisedJob { lines, completion } = job;
    let worker = tokio::spawn(run_worker(lines, completion, ProgressParser::new(layout.clone()), store, layout, rendezvous));
    (TrainingHandle { worker }, rx)
}

async fn open_log(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "training log unavailable");
            None
        }
    }
}

async fn run_worker(
    mut lines: LineStream,
    completion: JobCompletion,
    mut parser: ProgressParser,
    store: RecordStore,
    layout: StorageLayout,
    mut rendezvous: Rendezvous,
) -> TrainingResult<()> {
    let mut log = open_log(&layout.training_log()).await;
    let mut snapshot_failure: Option<TrainingError> = None;

    while let Some(line) = lines.next_line().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "reading job output failed");
                break;
            }
        };

        if let Some(file) = log.as_mut() {
            let mut entry = line.clone().into_bytes();
            entry.push(b'\n');
            if let Err(e) = file.write_all(&entry).await {
                warn!(error = %e, "appending to training log failed");
            }
        }

        if let LineOutcome::Progress { first } = parser.feed(&line) {
            if snapshot_failure.is_some() {
                continue;
            }
            match store.write_progress(parser.snapshot()) {
                Ok(()) if first => {
                    debug!(iteration = parser.snapshot().iteration, "first progress sample");
                    rendezvous.fulfil(FirstSample::Ready);
                }
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "writing progress snapshot failed, no further snapshots for this job");
                    let message = e.to_string();
                    snapshot_failure = Some(match rendezvous.fulfil(FirstSample::Failed(e)) {
                        Some(FirstSample::Failed(e)) => e,
                        _ => TrainingError::Other(anyhow::anyhow!("writing progress snapshot failed: {message}")),
                    });
                }
            }
        }
    }
    parser.close();

    if let Some(file) = log.as_mut() {
        let _ = file.flush().await;
    }

    let result = completion.wait().await;
    match &result {
        Ok(()) => info!(iteration = parser.snapshot().iteration, "training job finished"),
        Err(e) if e.is_busy_outcome() => info!("training job found the lock held"),
        Err(e) => error!(error = %e, "training job failed"),
    }
    let result = match (result, snapshot_failure) {
        (Ok(()), Some(e)) => Err(e),
        (result, _) => result,
    };

    // Once the caller has its answer, the outcome belongs to the handle.
    match rendezvous.fulfil(FirstSample::Finished(result)) {
        None => Ok(()),
        Some(FirstSample::Finished(result)) => result,
        Some(FirstSample::Ready | FirstSample::Failed(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::LineSplit;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn job(output: &str, result: TrainingResult<()>) -> SupervisedJob {
        let lines = LineStream::from_reader(Cursor::new(output.as_bytes().to_vec()), LineSplit::Newline).unwrap();
        SupervisedJob::new(lines, JobCompletion::ready(result))
    }

    fn setup() -> (TempDir, StorageLayout, RecordStore) {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().to_path_buf());
        layout.ensure_training_root().unwrap();
        let store = RecordStore::new(layout.clone());
        (temp, layout, store)
    }

    #[tokio::test]
    async fn test_first_sample_then_completion() {
        let (_temp, layout, store) = setup();
        let output = "\
Loading weights
Last accuracy mAP@0.50 = 75.00 %, best = 80.00 %
100: 0.5, 0.6 avg loss, 0.001 rate, 12.3 seconds, 64 images, 1.5 hours left
101: 0.4, 0.5 avg loss, 0.001 rate, 12.0 seconds, 128 images, 1.4 hours left
";
        let (handle, first) = spawn_progress_worker(job(output, Ok(())), layout.clone(), store.clone());

        assert!(matches!(first.await.unwrap(), FirstSample::Ready));
        handle.wait().await.unwrap();

        let snapshot = store.read_progress().unwrap().unwrap();
        assert_eq!(snapshot.iteration, 101);
        assert_eq!(snapshot.images, 128);
        assert_eq!(snapshot.map_last, 0.75);
        assert_eq!(snapshot.map_best, 0.80);

        let log = std::fs::read_to_string(layout.training_log()).unwrap();
        assert_eq!(log, output);
    }

    #[tokio::test]
    async fn test_stream_end_without_progress_still_signals() {
        let (_temp, layout, store) = setup();
        let output = "Loading weights\nnot a: progress line, hours left\n";
        let (handle, first) = spawn_progress_worker(job(output, Ok(())), layout, store.clone());

        assert!(matches!(first.await.unwrap(), FirstSample::Finished(Ok(()))));
        handle.wait().await.unwrap();
        assert_eq!(store.read_progress().unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_before_progress_reaches_caller() {
        let (_temp, layout, store) = setup();
        let failure = Err(TrainingError::ChildProcess { program: "umbra".to_string(), code: Some(2) });
        let (handle, first) = spawn_progress_worker(job("boom\n", failure), layout, store);

        match first.await.unwrap() {
            FirstSample::Finished(Err(TrainingError::ChildProcess { code: Some(2), .. })) => {}
            other => panic!("unexpected first sample: {other:?}"),
        }
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_after_progress_goes_to_handle() {
        let (_temp, layout, store) = setup();
        let output = "1: 2.0, 2.0 avg loss, 0.001 rate, 1.0 seconds, 64 images, 9.0 hours left\n";
        let failure = Err(TrainingError::ChildProcess { program: "umbra".to_string(), code: Some(1) });
        let (handle, first) = spawn_progress_worker(job(output, failure), layout, store.clone());

        assert!(matches!(first.await.unwrap(), FirstSample::Ready));
        assert!(handle.wait().await.is_err());
        assert_eq!(store.read_progress().unwrap().unwrap().iteration, 1);
    }

    #[tokio::test]
    async fn test_snapshot_write_failure_reaches_caller_and_handle() {
        let (_temp, layout, store) = setup();
        // A non-empty directory where the snapshot belongs cannot be replaced.
        std::fs::create_dir_all(layout.progress_snapshot().join("occupied")).unwrap();
        let output = "\
1: 2.0, 2.0 avg loss, 0.001 rate, 1.0 seconds, 64 images, 9.0 hours left
2: 1.5, 1.9 avg loss, 0.001 rate, 1.0 seconds, 128 images, 8.9 hours left
";
        let (handle, first) = spawn_progress_worker(job(output, Ok(())), layout.clone(), store);

        assert!(matches!(first.await.unwrap(), FirstSample::Failed(_)));
        let err = handle.wait().await.unwrap_err();
        assert!(err.to_string().contains("progress snapshot"));

        let log = std::fs::read_to_string(layout.training_log()).unwrap();
        assert_eq!(log, output);
    }
}
