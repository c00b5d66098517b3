//! Validation output grammar and the per-checkpoint accuracy index.

use crate::grammar::{self, ParseMismatch};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"class_id = (.*?), name = (.*?), ap = (.*?)%.*\(TP = (.*?), FP = (.*?)\)").expect("class grammar is valid")
});

static METRICS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"for conf_thresh = (.*?), precision = (.*?), recall = (.*?), F1-score = (.*?)$")
        .expect("metrics grammar is valid")
});

static COUNTS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"for conf_thresh = .*?, TP = (.*?), FP = (.*?), FN = (.*?), average IoU = (.*?) %")
        .expect("counts grammar is valid")
});

static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"mean average precision \(mAP@(.*?)\) = (.*?),.*$").expect("summary grammar is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub id: u32,
    pub name: String,
    /// Fraction, not percent.
    #[serde(rename = "ap")]
    pub average_precision: f64,
    #[serde(rename = "tp")]
    pub true_positives: u64,
    #[serde(rename = "fp")]
    pub false_positives: u64,
}

/// Evaluation result for a single checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub classes: Vec<ClassAccuracy>,
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    #[serde(rename = "tp")]
    pub true_positives: u64,
    #[serde(rename = "fp")]
    pub false_positives: u64,
    #[serde(rename = "fn")]
    pub false_negatives: u64,
    #[serde(rename = "averageIoU")]
    pub average_iou: f64,
    pub map: f64,
    #[serde(rename = "mapIouThreshold")]
    pub map_iou_threshold: f64,
}

impl AccuracyReport {
    /// Parse a full validation transcript.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parser = AccuracyParser::default();
        for line in lines {
            parser.feed(line.as_ref());
        }
        parser.finish()
    }
}

/// Accumulates one [`AccuracyReport`] from validation output, line by line.
#[derive(Debug, Default)]
pub struct AccuracyParser {
    report: AccuracyReport,
    mismatches: Vec<ParseMismatch>,
}

impl AccuracyParser {
    pub fn feed(&mut self, line: &str) {
        let line = line.trim();
        let result = if line.starts_with("class_id =") {
            self.apply_class(line)
        } else if line.starts_with("for conf_thresh =") {
            self.apply_threshold_line(line)
        } else if line.starts_with("mean average precision") {
            self.apply_summary(line)
        } else {
            Ok(())
        };

        if let Err(mismatch) = result {
            tracing::warn!(grammar = mismatch.grammar, line = ?mismatch.line, "ignoring validation line");
            self.mismatches.push(mismatch);
        }
    }

    #[must_use]
    pub fn mismatches(&self) -> &[ParseMismatch] {
        &self.mismatches
    }

    #[must_use]
    pub fn finish(self) -> AccuracyReport {
        self.report
    }

    fn apply_class(&mut self, line: &str) -> Result<(), ParseMismatch> {
        let caps = grammar::captures(&CLASS_RE, "class accuracy", line)?;
        self.report.classes.push(ClassAccuracy {
            id: grammar::field(&caps, 1, "id"),
            name: grammar::text(&caps, 2),
            average_precision: grammar::field::<f64>(&caps, 3, "ap") / 100.0,
            true_positives: grammar::field(&caps, 4, "tp"),
            false_positives: grammar::field(&caps, 5, "fp"),
        });
        Ok(())
    }

    // Both the metrics and the counts line share the `for conf_thresh =` prefix.
    fn apply_threshold_line(&mut self, line: &str) -> Result<(), ParseMismatch> {
        if let Some(caps) = METRICS_RE.captures(line) {
            self.report.threshold = grammar::field(&caps, 1, "threshold");
            self.report.precision = grammar::field(&caps, 2, "precision");
            self.report.recall = grammar::field(&caps, 3, "recall");
            self.report.f1 = grammar::field(&caps, 4, "f1");
            return Ok(());
        }
        let caps = grammar::captures(&COUNTS_RE, "threshold metrics", line)?;
        self.report.true_positives = grammar::field(&caps, 1, "tp");
        self.report.false_positives = grammar::field(&caps, 2, "fp");
        self.report.false_negatives = grammar::field(&caps, 3, "fn");
        self.report.average_iou = grammar::field::<f64>(&caps, 4, "averageIoU") / 100.0;
        Ok(())
    }

    fn apply_summary(&mut self, line: &str) -> Result<(), ParseMismatch> {
        let caps = grammar::captures(&SUMMARY_RE, "mAP summary", line)?;
        self.report.map_iou_threshold = grammar::field(&caps, 1, "mapIouThreshold");
        self.report.map = grammar::field(&caps, 2, "map");
        Ok(())
    }
}

/// Accuracy reports keyed by storage-relative checkpoint path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccuracyIndex(BTreeMap<String, AccuracyReport>);

impl AccuracyIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, checkpoint: impl Into<String>, report: AccuracyReport) {
        self.0.insert(checkpoint.into(), report);
    }

    #[must_use]
    pub fn get(&self, checkpoint: &str) -> Option<&AccuracyReport> {
        self.0.get(checkpoint)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AccuracyReport)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
