//! Application configuration.
//!
//! Precedence (highest first):
//! 1. CLI arguments (applied by the binary)
//! 2. Environment variables (`UMBRA_*`)
//! 3. Local config file (`./umbra.toml`)
//! 4. Global config file (`~/.umbra/config.toml`)
//! 5. Defaults

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingRequest;
use crate::layout::StorageLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the launcher runs a training job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Re-exec the current binary with the `train` subcommand.
    #[default]
    Subprocess,
    /// Call the runner in this process with stdout/stderr captured.
    InProcess,
}

impl std::str::FromStr for ExecutionMode {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subprocess" => Ok(Self::Subprocess),
            "in_process" | "in-process" | "inprocess" => Ok(Self::InProcess),
            other => Err(TrainingError::Config(format!("unknown execution mode: {other}"))),
        }
    }
}

/// Polling budget for status queries that find no snapshot yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
}

fn default_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_after_secs() -> u64 {
    5
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_after_secs: default_retry_after_secs(),
        }
    }
}

impl StatusConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Input/output directory.
    #[serde(default = "default_storage")]
    pub storage: PathBuf,

    /// Detector data manifest.
    #[serde(default)]
    pub data_file: Option<PathBuf>,

    /// Network definition.
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Starting weights.
    #[serde(default)]
    pub weights_file: Option<PathBuf>,

    /// Reset the iteration counter when training starts.
    #[serde(default)]
    pub clear: bool,

    /// Fraction of labelled samples routed to the validation split.
    #[serde(default = "default_dataset_split")]
    pub dataset_split: f64,

    /// Detector executable.
    #[serde(default = "default_darknet")]
    pub darknet: PathBuf,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default)]
    pub status: StatusConfig,
}

fn default_storage() -> PathBuf {
    PathBuf::from(".")
}

fn default_dataset_split() -> f64 {
    0.1
}

fn default_darknet() -> PathBuf {
    PathBuf::from("darknet")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            data_file: None,
            config_file: None,
            weights_file: None,
            clear: false,
            dataset_split: default_dataset_split(),
            darknet: default_darknet(),
            execution_mode: ExecutionMode::default(),
            status: StatusConfig::default(),
        }
    }
}

/// Partial config as read from a file; only present keys override.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    storage: Option<PathBuf>,
    data_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
    weights_file: Option<PathBuf>,
    clear: Option<bool>,
    dataset_split: Option<f64>,
    darknet: Option<PathBuf>,
    execution_mode: Option<ExecutionMode>,
    status: Option<StatusConfig>,
}

impl AppConfig {
    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".umbra")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from("umbra.toml")
    }

    /// Load configuration from a TOML file on top of the defaults.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let mut config = Self::default();
        config.merge_file(path)?;
        Ok(config)
    }

    /// Discover config files, then apply the environment.
    ///
    /// An explicit `path` replaces the local file lookup and must exist.
    pub fn discover_and_load(path: Option<&Path>) -> TrainingResult<Self> {
        let mut config = Self::default();

        let global = Self::default_global_path();
        if global.exists() {
            config.merge_file(&global)?;
        }

        match path {
            Some(explicit) => config.merge_file(explicit)?,
            None => {
                let local = Self::default_local_path();
                if local.exists() {
                    config.merge_file(&local)?;
                }
            }
        }

        config.merge_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> TrainingResult<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrainingError::Config(format!("{}: {e}", path.display())))?;
        let file: ConfigFile = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded configuration file");

        if let Some(v) = file.storage {
            self.storage = v;
        }
        if let Some(v) = file.data_file {
            self.data_file = Some(v);
        }
        if let Some(v) = file.config_file {
            self.config_file = Some(v);
        }
        if let Some(v) = file.weights_file {
            self.weights_file = Some(v);
        }
        if let Some(v) = file.clear {
            self.clear = v;
        }
        if let Some(v) = file.dataset_split {
            self.dataset_split = v;
        }
        if let Some(v) = file.darknet {
            self.darknet = v;
        }
        if let Some(v) = file.execution_mode {
            self.execution_mode = v;
        }
        if let Some(v) = file.status {
            self.status = v;
        }
        Ok(())
    }

    /// Override fields from `UMBRA_*` variables supplied by `lookup`.
    pub fn merge_env<F>(&mut self, lookup: F) -> TrainingResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("UMBRA_STORAGE") {
            self.storage = PathBuf::from(v);
        }
        if let Some(v) = non_empty("UMBRA_NN_DATA") {
            self.data_file = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("UMBRA_NN_CONFIG") {
            self.config_file = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("UMBRA_NN_WEIGHTS") {
            self.weights_file = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("UMBRA_NN_CLEAR") {
            self.clear = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = non_empty("UMBRA_DATASET_SPLIT") {
            self.dataset_split = v
                .trim()
                .parse()
                .map_err(|e| TrainingError::Config(format!("UMBRA_DATASET_SPLIT: {e}")))?;
        }
        if let Some(v) = non_empty("UMBRA_DARKNET") {
            self.darknet = PathBuf::from(v);
        }
        if let Some(v) = non_empty("UMBRA_EXECUTION_MODE") {
            self.execution_mode = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if !(0.0..=1.0).contains(&self.dataset_split) {
            return Err(TrainingError::Config(format!(
                "dataset_split must be within 0.0..=1.0, got {}",
                self.dataset_split
            )));
        }
        if self.status.retries == 0 {
            return Err(TrainingError::Config("status.retries must be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.storage.clone())
    }

    /// The configured files expressed as a request, used to fill gaps in incoming requests.
    #[must_use]
    pub fn default_request(&self) -> TrainingRequest {
        TrainingRequest {
            data: self.data_file.clone(),
            config: self.config_file.clone(),
            weights: self.weights_file.clone(),
            clear: self.clear,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.storage, PathBuf::from("."));
        assert_eq!(config.status.retries, 5);
        assert_eq!(config.status.retry_after_secs, 5);
        assert_eq!(config.execution_mode, ExecutionMode::Subprocess);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_overrides_present_keys_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("umbra.toml");
        std::fs::write(
            &path,
            r#"
storage = "/srv/umbra"
data_file = "obj.data"
execution_mode = "in_process"

[status]
retries = 2
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.storage, PathBuf::from("/srv/umbra"));
        assert_eq!(config.data_file, Some(PathBuf::from("obj.data")));
        assert_eq!(config.execution_mode, ExecutionMode::InProcess);
        assert_eq!(config.status.retries, 2);
        assert_eq!(config.status.retry_delay_ms, 1000);
        assert_eq!(config.darknet, PathBuf::from("darknet"));
    }

    #[test]
    fn test_load_from_missing_file_is_config_error() {
        let err = AppConfig::load_from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
    }

    #[test]
    fn test_merge_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("UMBRA_STORAGE", "/data"),
            ("UMBRA_NN_CONFIG", "yolo.cfg"),
            ("UMBRA_NN_CLEAR", "true"),
            ("UMBRA_DATASET_SPLIT", "0.25"),
            ("UMBRA_NN_WEIGHTS", ""),
        ]);
        let mut config = AppConfig::default();
        config.merge_env(|k| env.get(k).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.storage, PathBuf::from("/data"));
        assert_eq!(config.config_file, Some(PathBuf::from("yolo.cfg")));
        assert!(config.clear);
        assert!((config.dataset_split - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.weights_file, None);
    }

    #[test]
    fn test_merge_env_rejects_bad_split() {
        let mut config = AppConfig::default();
        let result = config.merge_env(|k| (k == "UMBRA_DATASET_SPLIT").then(|| "lots".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_split() {
        let config = AppConfig { dataset_split: 1.5, ..AppConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_execution_mode_from_str() {
        assert_eq!("in-process".parse::<ExecutionMode>().unwrap(), ExecutionMode::InProcess);
        assert_eq!("Subprocess".parse::<ExecutionMode>().unwrap(), ExecutionMode::Subprocess);
        assert!("threads".parse::<ExecutionMode>().is_err());
    }
}
