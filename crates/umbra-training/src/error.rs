use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Exit status of a launched job that found the lock already held (`EX_TEMPFAIL`).
pub const EXIT_BUSY: i32 = 75;

/// Which exclusivity primitive turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Training,
    Validation,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Training => f.write_str("training"),
            Self::Validation => f.write_str("validation"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    /// The lock or guard is already held. Expected, not a failure.
    #[error("{0} already running")]
    Busy(LockKind),

    #[error("invalid training request: {0}")]
    InvalidRequest(String),

    #[error("data manifest error: {0}")]
    Manifest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{program} exited with {}", exit_description(.code))]
    ChildProcess { program: String, code: Option<i32> },

    #[error("no accuracy index at {}", .0.display())]
    AccuracyIndexMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn exit_description(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code (terminated by signal)".to_string(), |c| format!("exit code {c}"))
}

impl TrainingError {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// A busy rejection, whether raised in this process or reported by a launched one.
    #[must_use]
    pub fn is_busy_outcome(&self) -> bool {
        self.is_busy() || matches!(self, Self::ChildProcess { code: Some(EXIT_BUSY), .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_process_message_includes_code() {
        let err = TrainingError::ChildProcess { program: "darknet".to_string(), code: Some(3) };
        assert_eq!(err.to_string(), "darknet exited with exit code 3");

        let err = TrainingError::ChildProcess { program: "darknet".to_string(), code: None };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_busy_is_distinct_from_failures() {
        assert!(TrainingError::Busy(LockKind::Validation).is_busy());
        assert!(!TrainingError::InvalidRequest("x".to_string()).is_busy());
        assert_eq!(TrainingError::Busy(LockKind::Training).to_string(), "training already running");
    }

    #[test]
    fn test_busy_exit_code_counts_as_busy_outcome() {
        let busy_child = TrainingError::ChildProcess { program: "umbra".to_string(), code: Some(EXIT_BUSY) };
        assert!(!busy_child.is_busy());
        assert!(busy_child.is_busy_outcome());
        assert!(!TrainingError::ChildProcess { program: "umbra".to_string(), code: Some(1) }.is_busy_outcome());
    }
}
