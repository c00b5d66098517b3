//! Process supervision and the line stream abstraction.
//!
//! A supervised job, whether a child process or an in-process call with
//! redirected descriptors (see [`crate::capture`]), is presented as a
//! [`SupervisedJob`]: an ordered [`LineStream`] of its combined stdout and
//! stderr plus a [`JobCompletion`] resolving to its outcome. Children are not
//! cancelled once launched.

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingRequest;
use crate::registry::Checkpoint;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

const READ_CHUNK: usize = 8 * 1024;
const LINE_BUFFER: usize = 256;
/// Trailing output lines logged when a job fails.
const FAILURE_TAIL: usize = 10;

/// Where one line ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSplit {
    /// `\n`, with a trailing `\r` stripped.
    #[default]
    Newline,
    /// Either `\r` or `\n`. Validation output redraws progress with bare `\r`.
    CarriageReturnOrNewline,
}

/// Incremental byte-to-line splitter. Bytes are decoded lossily as UTF-8.
#[derive(Debug)]
pub struct LineSplitter {
    split: LineSplit,
    pending: Vec<u8>,
}

impl LineSplitter {
    #[must_use]
    pub fn new(split: LineSplit) -> Self {
        Self { split, pending: Vec::new() }
    }

    /// Feed `bytes`, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &b) in self.pending.iter().enumerate() {
            let boundary = match self.split {
                LineSplit::Newline => b == b'\n',
                LineSplit::CarriageReturnOrNewline => b == b'\n' || b == b'\r',
            };
            if boundary {
                lines.push(self.decode(&self.pending[start..i]));
                start = i + 1;
            }
        }
        self.pending.drain(..start);
        lines
    }

    /// The unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(self.decode(&tail))
    }

    fn decode(&self, raw: &[u8]) -> String {
        let raw = match self.split {
            LineSplit::Newline => raw.strip_suffix(b"\r").unwrap_or(raw),
            LineSplit::CarriageReturnOrNewline => raw,
        };
        String::from_utf8_lossy(raw).into_owned()
    }
}

/// Ordered lines of a job's output, consumed by exactly one reader.
#[derive(Debug)]
pub struct LineStream {
    rx: mpsc::Receiver<io::Result<String>>,
}

impl LineStream {
    /// Read `reader` to EOF on a dedicated thread.
    pub fn from_reader<R>(reader: R, split: LineSplit) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        std::thread::Builder::new()
            .name("umbra-lines".to_string())
            .spawn(move || pump(reader, split, &tx))?;
        Ok(Self { rx })
    }

    /// Next line, or `None` once the writer side is closed.
    pub async fn next_line(&mut self) -> Option<io::Result<String>> {
        self.rx.recv().await
    }

    /// Drain the stream.
    pub async fn collect(mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line?);
        }
        Ok(lines)
    }
}

fn pump<R: Read>(mut reader: R, split: LineSplit, tx: &mpsc::Sender<io::Result<String>>) {
    let mut splitter = LineSplitter::new(split);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.blocking_send(Ok(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
    if let Some(tail) = splitter.finish() {
        let _ = tx.blocking_send(Ok(tail));
    }
}

enum Completion {
    Child { program: String, child: Child },
    Native(oneshot::Receiver<TrainingResult<()>>),
    Ready(TrainingResult<()>),
}

/// Resolves once the job has finished.
pub struct JobCompletion(Completion);

impl std::fmt::Debug for JobCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.0 {
            Completion::Child { program, .. } => program.as_str(),
            Completion::Native(_) => "native",
            Completion::Ready(_) => "ready",
        };
        f.debug_tuple("JobCompletion").field(&kind).finish()
    }
}

impl JobCompletion {
    #[must_use]
    pub fn from_child(program: impl Into<String>, child: Child) -> Self {
        Self(Completion::Child { program: program.into(), child })
    }

    #[must_use]
    pub fn from_native(rx: oneshot::Receiver<TrainingResult<()>>) -> Self {
        Self(Completion::Native(rx))
    }

    #[must_use]
    pub fn ready(result: TrainingResult<()>) -> Self {
        Self(Completion::Ready(result))
    }

    /// Wait for the job. A non-zero exit becomes [`TrainingError::ChildProcess`].
    pub async fn wait(self) -> TrainingResult<()> {
        match self.0 {
            Completion::Child { program, mut child } => {
                let status = child.wait().await?;
                if status.success() {
                    Ok(())
                } else {
                    Err(TrainingError::ChildProcess { program, code: status.code() })
                }
            }
            Completion::Native(rx) => rx
                .await
                .map_err(|_| TrainingError::Other(anyhow::anyhow!("in-process job ended without reporting a result")))?,
            Completion::Ready(result) => result,
        }
    }
}

/// A launched job: its output and its eventual outcome.
#[derive(Debug)]
pub struct SupervisedJob {
    pub lines: LineStream,
    pub completion: JobCompletion,
}

impl SupervisedJob {
    #[must_use]
    pub fn new(lines: LineStream, completion: JobCompletion) -> Self {
        Self { lines, completion }
    }

    /// Collect every line, then wait for the job to finish. A failure logs the
    /// end of the output, which is where the job's own diagnostics are.
    pub async fn run_to_end(self) -> TrainingResult<Vec<String>> {
        let lines = self.lines.collect().await?;
        if let Err(e) = self.completion.wait().await {
            tracing::warn!(error = %e, output = ?output_tail(&lines), "job failed");
            return Err(e);
        }
        Ok(lines)
    }
}

fn output_tail(lines: &[String]) -> &[String] {
    &lines[lines.len().saturating_sub(FAILURE_TAIL)..]
}

/// What a launched job does. Rendered as a subcommand of the job executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    Train(TrainingRequest),
    Validate(TrainingRequest),
}

impl JobCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Train(_) => "train",
            Self::Validate(_) => "validate",
        }
    }

    #[must_use]
    pub fn request(&self) -> &TrainingRequest {
        match self {
            Self::Train(request) | Self::Validate(request) => request,
        }
    }
}

/// One launch of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub storage: PathBuf,
    pub command: JobCommand,
    pub cwd: Option<PathBuf>,
    pub split: LineSplit,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl LaunchSpec {
    #[must_use]
    pub fn training(storage: &Path, request: TrainingRequest) -> Self {
        Self { storage: storage.to_path_buf(), command: JobCommand::Train(request), cwd: None, split: LineSplit::Newline }
    }

    /// Evaluate one checkpoint from inside its job directory.
    #[must_use]
    pub fn validation(storage: &Path, checkpoint: &Checkpoint) -> Self {
        let request = TrainingRequest {
            data: Some(checkpoint.data_file()),
            config: Some(checkpoint.network_file()),
            weights: Some(checkpoint.weights.clone()),
            clear: false,
        };
        Self {
            storage: storage.to_path_buf(),
            command: JobCommand::Validate(request),
            cwd: Some(checkpoint.job_dir.clone()),
            split: LineSplit::CarriageReturnOrNewline,
        }
    }

    /// `<cmd> --storage <dir> [--data <file>] [--config <file>] [--weights <file>] [--clear]`
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let request = self.command.request();
        let mut args = vec![self.command.name().to_string(), "--storage".to_string(), path_arg(&self.storage)];
        for (flag, value) in [("--data", &request.data), ("--config", &request.config), ("--weights", &request.weights)] {
            if let Some(path) = value {
                args.extend([flag.to_string(), path_arg(path)]);
            }
        }
        if request.clear {
            args.push("--clear".to_string());
        }
        args
    }
}

/// Starts jobs described by a [`LaunchSpec`].
pub trait JobLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> TrainingResult<SupervisedJob>;
}

/// Re-executes a program with stdout and stderr merged into one pipe.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    #[must_use]
    pub fn new(program: PathBuf) -> Self {
        Self { program, envs: Vec::new() }
    }

    /// Set an environment variable on every launched job.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Re-invoke the running executable.
    pub fn current_exe() -> TrainingResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Spawn the program with raw `args`.
    pub fn spawn(&self, args: &[String], cwd: Option<&Path>, split: LineSplit) -> TrainingResult<SupervisedJob> {
        let (reader, writer) = io::pipe()?;
        let stderr = writer.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let program = self.program.display().to_string();
        let child = cmd.spawn().map_err(|e| {
            tracing::error!(program = %program, error = %e, "failed to launch job");
            TrainingError::Io(e)
        })?;
        // The command still owns the parent's copies of the write end; EOF needs them closed.
        drop(cmd);

        tracing::debug!(program = %program, ?args, pid = ?child.id(), "job launched");
        let lines = LineStream::from_reader(reader, split)?;
        Ok(SupervisedJob::new(lines, JobCompletion::from_child(program, child)))
    }
}

impl JobLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> TrainingResult<SupervisedJob> {
        self.spawn(&spec.args(), spec.cwd.as_deref(), spec.split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newline_split_strips_carriage_return() {
        let mut splitter = LineSplitter::new(LineSplit::Newline);
        assert_eq!(splitter.push(b"one\r\ntw"), vec!["one"]);
        assert_eq!(splitter.push(b"o\n\nthree"), vec!["two", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("three"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_carriage_return_split() {
        let mut splitter = LineSplitter::new(LineSplit::CarriageReturnOrNewline);
        assert_eq!(splitter.push(b" 4\r 8\rclass_id = 0\nmean"), vec![" 4", " 8", "class_id = 0"]);
        assert_eq!(splitter.finish().as_deref(), Some("mean"));
    }

    #[test]
    fn test_lossy_utf8() {
        let mut splitter = LineSplitter::new(LineSplit::Newline);
        assert_eq!(splitter.push(b"ok \xff\n"), vec!["ok \u{fffd}"]);
    }

    #[tokio::test]
    async fn test_line_stream_preserves_order() {
        let input = (0..1000).map(|i| format!("line {i}\n")).collect::<String>();
        let stream = LineStream::from_reader(std::io::Cursor::new(input.into_bytes()), LineSplit::Newline).unwrap();
        let lines = stream.collect().await.unwrap();
        assert_eq!(lines.len(), 1000);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[999], "line 999");
    }

    #[test]
    fn test_training_args() {
        let request = TrainingRequest {
            data: Some(PathBuf::from("/d/obj.data")),
            config: Some(PathBuf::from("/d/yolo.cfg")),
            weights: None,
            clear: true,
        };
        let spec = LaunchSpec::training(Path::new("/srv"), request);
        assert_eq!(
            spec.args(),
            vec!["train", "--storage", "/srv", "--data", "/d/obj.data", "--config", "/d/yolo.cfg", "--clear"]
        );
        assert_eq!(spec.cwd, None);
        assert_eq!(spec.split, LineSplit::Newline);
    }

    #[test]
    fn test_validation_args_scoped_to_job() {
        let job_dir = PathBuf::from("/srv/train/01012024_000000");
        let checkpoint = Checkpoint {
            key: "train/01012024_000000/weights/net_final.weights".to_string(),
            weights: job_dir.join("weights").join("net_final.weights"),
            job_dir: job_dir.clone(),
        };
        let spec = LaunchSpec::validation(Path::new("/srv"), &checkpoint);
        let args = spec.args();
        assert_eq!(args[0], "validate");
        assert!(args.contains(&path_arg(&job_dir.join("dataset.cfg"))));
        assert!(args.contains(&path_arg(&job_dir.join("network.cfg"))));
        assert!(args.contains(&path_arg(&checkpoint.weights)));
        assert!(!args.contains(&"--clear".to_string()));
        assert_eq!(spec.cwd.as_deref(), Some(job_dir.as_path()));
        assert_eq!(spec.split, LineSplit::CarriageReturnOrNewline);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_merges_streams() {
        let launcher = ProcessLauncher::new(PathBuf::from("sh"));
        let args = ["-c".to_string(), "echo out; echo err 1>&2; echo done".to_string()];
        let lines = launcher.spawn(&args, None, LineSplit::Newline).unwrap().run_to_end().await.unwrap();
        assert_eq!(lines, vec!["out", "err", "done"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_passes_env() {
        let launcher = ProcessLauncher::new(PathBuf::from("sh")).with_env("UMBRA_DARKNET", "/opt/darknet");
        let args = ["-c".to_string(), "echo $UMBRA_DARKNET".to_string()];
        let lines = launcher.spawn(&args, None, LineSplit::Newline).unwrap().run_to_end().await.unwrap();
        assert_eq!(lines, vec!["/opt/darknet"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_reports_exit_code() {
        let launcher = ProcessLauncher::new(PathBuf::from("sh"));
        let args = ["-c".to_string(), "echo partial; exit 75".to_string()];
        let job = launcher.spawn(&args, None, LineSplit::Newline).unwrap();
        let lines = job.lines.collect().await.unwrap();
        assert_eq!(lines, vec!["partial"]);

        let err = job.completion.wait().await.unwrap_err();
        assert!(matches!(err, TrainingError::ChildProcess { code: Some(75), .. }));
        assert!(err.is_busy_outcome());
    }

    #[tokio::test]
    async fn test_run_to_end_keeps_failure() {
        let lines = LineStream::from_reader(io::Cursor::new(b"loading\ncannot open weights\n".to_vec()), LineSplit::Newline)
            .unwrap();
        let failure = Err(TrainingError::ChildProcess { program: "umbra".to_string(), code: Some(1) });
        let err = SupervisedJob::new(lines, JobCompletion::ready(failure)).run_to_end().await.unwrap_err();
        assert!(matches!(err, TrainingError::ChildProcess { code: Some(1), .. }));
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let lines: Vec<String> = (0..25).map(|i| format!("line {i}")).collect();
        let tail = output_tail(&lines);
        assert_eq!(tail.len(), FAILURE_TAIL);
        assert_eq!(tail.last().map(String::as_str), Some("line 24"));
        assert_eq!(output_tail(&lines[..3]).len(), 3);
    }
}
