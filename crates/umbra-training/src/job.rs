use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory-name format for job ids (`DDMMYYYY_HHMMSS`).
pub const JOB_ID_FORMAT: &str = "%d%m%Y_%H%M%S";

/// Identifier for a training job: the name of its workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn from_timestamp(at: DateTime<Local>) -> Self {
        Self(at.format(JOB_ID_FORMAT).to_string())
    }

    /// Disambiguated id for the `attempt`-th collision within the same second.
    #[must_use]
    pub fn with_suffix(&self, attempt: u32) -> Self {
        if attempt == 0 {
            return self.clone();
        }
        Self(format!("{}-{attempt}", self.0))
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Body of a "start training" call. Empty fields fall back to the configured files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRequest {
    #[serde(default)]
    pub data: Option<PathBuf>,
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub weights: Option<PathBuf>,
    #[serde(default)]
    pub clear: bool,
}

impl TrainingRequest {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.data.as_ref().is_none_or(|p| p.as_os_str().is_empty()) {
            return Err(TrainingError::InvalidRequest("data file is required".to_string()));
        }
        if self.config.as_ref().is_none_or(|p| p.as_os_str().is_empty()) {
            return Err(TrainingError::InvalidRequest("network config file is required".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn or_defaults(self, defaults: &Self) -> Self {
        Self {
            data: self.data.or_else(|| defaults.data.clone()),
            config: self.config.or_else(|| defaults.config.clone()),
            weights: self.weights.or_else(|| defaults.weights.clone()),
            clear: self.clear || defaults.clear,
        }
    }
}

/// A provisioned training workspace. Created once per launch, never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingJob {
    pub id: TrainingJobId,
    pub root: PathBuf,
    pub dataset_dir: PathBuf,
    pub weights_dir: PathBuf,
    /// Rewritten data manifest (`dataset.cfg`).
    pub data_file: PathBuf,
    /// Copied network definition (`network.cfg`).
    pub network_file: PathBuf,
    pub starting_weights: Option<PathBuf>,
    pub names_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_validate_requires_data_and_config() {
        assert!(TrainingRequest::default().validate().is_err());

        let req = TrainingRequest { data: Some(PathBuf::from("obj.data")), ..Default::default() };
        assert!(req.validate().is_err());

        let req = TrainingRequest {
            data: Some(PathBuf::from("obj.data")),
            config: Some(PathBuf::from("yolo.cfg")),
            ..Default::default()
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_request_falls_back_to_defaults() {
        let defaults = TrainingRequest {
            data: Some(PathBuf::from("obj.data")),
            config: Some(PathBuf::from("yolo.cfg")),
            weights: Some(PathBuf::from("start.weights")),
            clear: false,
        };
        let req = TrainingRequest { config: Some(PathBuf::from("other.cfg")), clear: true, ..Default::default() };
        let merged = req.or_defaults(&defaults);
        assert_eq!(merged.data, Some(PathBuf::from("obj.data")));
        assert_eq!(merged.config, Some(PathBuf::from("other.cfg")));
        assert_eq!(merged.weights, Some(PathBuf::from("start.weights")));
        assert!(merged.clear);
    }

    #[test]
    fn test_request_deserializes_json_body() {
        let req: TrainingRequest = serde_json::from_str(r#"{"data": "a.data", "clear": true}"#).unwrap();
        assert_eq!(req.data, Some(PathBuf::from("a.data")));
        assert!(req.config.is_none());
        assert!(req.clear);
    }

    #[test]
    fn test_job_id_format_and_suffix() {
        let at = Local.with_ymd_and_hms(2024, 2, 1, 10, 5, 9).unwrap();
        let id = TrainingJobId::from_timestamp(at);
        assert_eq!(id.0, "01022024_100509");
        assert_eq!(id.with_suffix(0), id);
        assert_eq!(id.with_suffix(2).0, "01022024_100509-2");
    }
}
