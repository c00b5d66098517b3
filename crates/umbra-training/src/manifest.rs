//! Detector data manifest (`classes = 2`, `train = train.txt`, ...).

use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataKey {
    Classes,
    Train,
    Valid,
    Names,
    Backup,
    Other(String),
}

impl DataKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Classes => "classes",
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Names => "names",
            Self::Backup => "backup",
            Self::Other(key) => key,
        }
    }

    /// Keys whose values are file paths relative to the manifest.
    #[must_use]
    pub fn is_path(&self) -> bool {
        matches!(self, Self::Train | Self::Valid | Self::Names | Self::Backup)
    }
}

impl From<&str> for DataKey {
    fn from(key: &str) -> Self {
        match key {
            "classes" => Self::Classes,
            "train" => Self::Train,
            "valid" => Self::Valid,
            "names" => Self::Names,
            "backup" => Self::Backup,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered key/value manifest. Remembers where it was read from so relative
/// path values can be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataManifest {
    entries: Vec<(DataKey, String)>,
    path: Option<PathBuf>,
}

impl DataManifest {
    /// Parse manifest text. Tokens are split on `=` and newlines and alternate key, value.
    pub fn parse(text: &str) -> TrainingResult<Self> {
        let mut manifest = Self::default();
        let mut pending: Option<String> = None;

        let tokens = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(|line| line.split('='))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        for token in tokens {
            match pending.take() {
                None => pending = Some(token.to_string()),
                Some(key) => manifest.set(DataKey::from(key.as_str()), token),
            }
        }

        if let Some(key) = pending {
            return Err(TrainingError::Manifest(format!("key `{key}` has no value")));
        }
        Ok(manifest)
    }

    pub fn read_file(path: &Path) -> TrainingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut manifest = Self::parse(&text)?;
        manifest.path = Some(std::path::absolute(path)?);
        Ok(manifest)
    }

    /// Raw value as written in the manifest.
    #[must_use]
    pub fn raw(&self, key: &DataKey) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Value for `key`; path-valued keys resolve against the manifest's directory.
    #[must_use]
    pub fn get(&self, key: &DataKey) -> Option<String> {
        let value = self.raw(key)?;
        if key.is_path() && !Path::new(value).is_absolute() {
            if let Some(dir) = self.path.as_deref().and_then(Path::parent) {
                return Some(dir.join(value).to_string_lossy().into_owned());
            }
        }
        Some(value.to_string())
    }

    /// Set `key`, keeping its original position if already present.
    pub fn set(&mut self, key: DataKey, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn write_file(&self, path: &Path) -> TrainingResult<()> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl std::fmt::Display for DataManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{key} = {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_tolerates_spacing() {
        let manifest = DataManifest::parse(
            "
		classes=6
		train= example/train.txt
		valid =example/test.txt
		names = example/obj.names
	",
        )
        .unwrap();

        assert_eq!(manifest.get(&DataKey::Classes).as_deref(), Some("6"));
        assert_eq!(manifest.get(&DataKey::Train).as_deref(), Some("example/train.txt"));
        assert_eq!(manifest.get(&DataKey::Valid).as_deref(), Some("example/test.txt"));
        assert_eq!(manifest.get(&DataKey::Names).as_deref(), Some("example/obj.names"));
        assert_eq!(
            manifest.to_string(),
            "classes = 6\ntrain = example/train.txt\nvalid = example/test.txt\nnames = example/obj.names"
        );
    }

    #[test]
    fn test_read_file_resolves_relative_paths() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("obj.data");
        std::fs::write(&path, "classes = 6\ntrain = train.txt\nvalid = valid.txt\nnames = names.txt\n").unwrap();

        let manifest = DataManifest::read_file(&path).unwrap();
        let dir = std::path::absolute(temp.path()).unwrap();
        assert_eq!(manifest.get(&DataKey::Classes).as_deref(), Some("6"));
        assert_eq!(manifest.get(&DataKey::Train), Some(dir.join("train.txt").to_string_lossy().into_owned()));
        assert_eq!(manifest.get(&DataKey::Names), Some(dir.join("names.txt").to_string_lossy().into_owned()));
        assert_eq!(manifest.raw(&DataKey::Valid), Some("valid.txt"));
        assert_eq!(manifest.to_string(), "classes = 6\ntrain = train.txt\nvalid = valid.txt\nnames = names.txt");
    }

    #[test]
    fn test_set_preserves_order() {
        let mut manifest = DataManifest::default();
        manifest.set(DataKey::Classes, "6");
        manifest.set(DataKey::Train, "example/train.txt");
        manifest.set(DataKey::Valid, "example/valid.txt");
        manifest.set(DataKey::Names, "example/obj.names");
        manifest.set(DataKey::Backup, "backup/");
        manifest.set(DataKey::Train, "train.txt");

        assert_eq!(
            manifest.to_string(),
            "classes = 6\ntrain = train.txt\nvalid = example/valid.txt\nnames = example/obj.names\nbackup = backup/"
        );
    }

    #[test]
    fn test_unknown_keys_round_trip_and_comments_skipped() {
        let manifest = DataManifest::parse("# comment\neval = coco\nclasses = 1").unwrap();
        assert_eq!(manifest.get(&DataKey::Other("eval".to_string())).as_deref(), Some("coco"));
        assert_eq!(manifest.to_string(), "eval = coco\nclasses = 1");
    }

    #[test]
    fn test_dangling_key_is_rejected() {
        assert!(matches!(DataManifest::parse("classes = 2\ntrain"), Err(TrainingError::Manifest(_))));
    }
}
