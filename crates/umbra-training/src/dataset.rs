//! Labelled sample bookkeeping: YOLO label files and the train/valid lists.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::StorageLayout;
use crate::manifest::{DataKey, DataManifest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub class: u32,
}

impl Label {
    /// `<class> <cx> <cy> <w> <h>`, normalised to the image size.
    #[must_use]
    pub fn to_yolo(&self, width: u32, height: u32) -> String {
        let (sw, sh) = (f64::from(width), f64::from(height));
        let w = (self.x2 - self.x1) / sw;
        let h = (self.y2 - self.y1) / sh;
        format!("{} {:.6} {:.6} {:.6} {:.6}", self.class, self.x1 / sw + w / 2.0, self.y1 / sh + h / 2.0, w, h)
    }

    pub fn from_yolo(line: &str, width: u32, height: u32) -> TrainingResult<Self> {
        let malformed = || TrainingError::InvalidRequest(format!("malformed label line: {line:?}"));
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [class, x, y, w, h] = parts.as_slice() else {
            return Err(malformed());
        };

        let class: u32 = class.parse().map_err(|_| malformed())?;
        let mut nums = [0.0f64; 4];
        for (slot, raw) in nums.iter_mut().zip([x, y, w, h]) {
            *slot = raw.parse().map_err(|_| malformed())?;
        }
        let [x, y, w, h] = nums;

        let (sw, sh) = (f64::from(width), f64::from(height));
        Ok(Self {
            x1: x * sw - w * sw / 2.0,
            y1: y * sh - h * sh / 2.0,
            x2: x * sw + w * sw / 2.0,
            y2: y * sh + h * sh / 2.0,
            class,
        })
    }
}

/// Boxes of a YOLO label file, in pixels of a `width` x `height` image. Blank lines are skipped.
pub fn read_label_file(path: &Path, width: u32, height: u32) -> TrainingResult<Vec<Label>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Label::from_yolo(line, width, height))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Valid,
}

/// Routes new samples so the validation share follows the configured fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitBalancer {
    fraction: f64,
    train: usize,
    valid: usize,
}

impl SplitBalancer {
    #[must_use]
    pub fn new(fraction: f64, train: usize, valid: usize) -> Self {
        Self { fraction, train, valid }
    }

    /// Seed the counts from existing list files. Missing lists count as empty.
    pub fn from_lists(fraction: f64, train: &Path, valid: &Path) -> TrainingResult<Self> {
        Ok(Self::new(fraction, count_entries(train)?, count_entries(valid)?))
    }

    /// Valid while it is below its share of the dataset including this sample.
    pub fn choose(&mut self) -> Split {
        let total = (self.train + self.valid + 1) as f64;
        if (self.valid as f64) < self.fraction * total {
            self.valid += 1;
            Split::Valid
        } else {
            self.train += 1;
            Split::Train
        }
    }

    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        (self.train, self.valid)
    }
}

fn count_entries(path: &Path) -> TrainingResult<usize> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().filter(|l| !l.trim().is_empty()).count()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Where a labelled sample ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelledSample {
    pub image: PathBuf,
    pub label: PathBuf,
    pub split: Split,
}

/// Adds labelled images to `<storage>/dataset/` and the manifest's split lists.
#[derive(Debug)]
pub struct DatasetWriter {
    layout: StorageLayout,
    train_list: PathBuf,
    valid_list: PathBuf,
    balancer: SplitBalancer,
}

impl DatasetWriter {
    pub fn open(layout: StorageLayout, manifest: &DataManifest, fraction: f64) -> TrainingResult<Self> {
        let list = |key: DataKey| {
            manifest
                .get(&key)
                .map(PathBuf::from)
                .ok_or_else(|| TrainingError::Manifest(format!("data manifest has no `{key}` list")))
        };
        let train_list = list(DataKey::Train)?;
        let valid_list = list(DataKey::Valid)?;
        let balancer = SplitBalancer::from_lists(fraction, &train_list, &valid_list)?;
        Ok(Self { layout, train_list, valid_list, balancer })
    }

    #[must_use]
    pub fn balancer(&self) -> &SplitBalancer {
        &self.balancer
    }

    /// Store `image` under its SHA-256, write its YOLO labels, and list it in the chosen split.
    pub fn add_sample(
        &mut self,
        image: &[u8],
        ext: &str,
        labels: &[Label],
        width: u32,
        height: u32,
    ) -> TrainingResult<LabelledSample> {
        let dir = self.layout.dataset_dir();
        fs::create_dir_all(&dir)?;

        let digest = hex::encode(Sha256::digest(image));
        let image_path = dir.join(format!("{digest}.{}", ext.trim_start_matches('.')));
        let label_path = dir.join(format!("{digest}.txt"));
        fs::write(&image_path, image)?;

        let split = self.balancer.choose();
        let list = match split {
            Split::Train => &self.train_list,
            Split::Valid => &self.valid_list,
        };
        append_entry(list, &self.layout.relative(&image_path))?;

        let yolo: Vec<String> = labels.iter().map(|l| l.to_yolo(width, height)).collect();
        fs::write(&label_path, yolo.join("\n"))?;

        tracing::info!(image = %image_path.display(), ?split, labels = labels.len(), "sample labelled");
        Ok(LabelledSample { image: image_path, label: label_path, split })
    }
}

fn append_entry(list: &Path, entry: &str) -> TrainingResult<()> {
    let needs_newline = match fs::read(list) {
        Ok(existing) => existing.last().is_some_and(|b| *b != b'\n'),
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    let mut file = fs::OpenOptions::new().create(true).append(true).open(list)?;
    if needs_newline {
        file.write_all(b"\n")?;
    }
    file.write_all(entry.as_bytes())?;
    Ok(())
}
