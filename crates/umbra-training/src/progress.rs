//! Training output grammar and the progress snapshot it maintains.

use crate::grammar::{self, ParseMismatch};
use crate::layout::StorageLayout;
use crate::registry;
use crate::workspace::SESSION_CREATED_MARKER;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ITERATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\d+): ([0-9.]+), ([0-9.]+) avg loss, ([0-9.]+) rate, ([0-9.]+) seconds, (\d+) images, ([+-]?[0-9.]+) hours left",
    )
    .expect("iteration grammar is valid")
});

static MAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Last accuracy mAP@([0-9.]+) = ([0-9.]+)\s*%, best = ([0-9.]+)\s*%")
        .expect("mAP grammar is valid")
});

const MAP_PREFIX: &str = "Last accuracy mAP@";
const ITERATION_SUFFIX: &str = "hours left";

/// Latest observed state of a training job. mAP values are fractions, not percentages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub iteration: u64,
    pub loss: f64,
    pub avg_loss: f64,
    pub current_rate: f64,
    pub elapsed_seconds: f64,
    pub images: u64,
    pub hours_left: f64,
    pub map_iou_threshold: f64,
    pub map_last: f64,
    pub map_best: f64,
    /// Storage-relative job directory.
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    AwaitingFirstSample,
    Streaming,
    Closed,
}

/// What a single line did to the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Iteration line parsed; the snapshot should be flushed.
    Progress { first: bool },
    /// mAP summary folded into the in-memory snapshot.
    MapUpdated,
    TargetRecorded,
    Mismatch(ParseMismatch),
    Ignored,
}

/// Stateful parser over the training output stream.
#[derive(Debug)]
pub struct ProgressParser {
    layout: StorageLayout,
    snapshot: ProgressSnapshot,
    state: ParserState,
}

impl ProgressParser {
    #[must_use]
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout, snapshot: ProgressSnapshot::default(), state: ParserState::AwaitingFirstSample }
    }

    #[must_use]
    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn close(&mut self) {
        self.state = ParserState::Closed;
    }

    pub fn feed(&mut self, line: &str) -> LineOutcome {
        let line = line.trim();
        let mut outcome = LineOutcome::Ignored;

        if self.snapshot.target.is_empty() && line.contains(SESSION_CREATED_MARKER) {
            match registry::latest_job_dir(&self.layout) {
                Ok(Some(target)) => {
                    tracing::info!(target = %target, "training workspace detected");
                    self.snapshot.target = target;
                    outcome = LineOutcome::TargetRecorded;
                }
                Ok(None) => tracing::warn!("session marker seen but no job directory exists"),
                Err(e) => tracing::warn!(error = %e, "could not resolve training workspace"),
            }
        }

        if line.starts_with(MAP_PREFIX) {
            outcome = match self.apply_map(line) {
                Ok(()) => LineOutcome::MapUpdated,
                Err(mismatch) => {
                    tracing::warn!(grammar = mismatch.grammar, line = ?mismatch.line, "ignoring mAP line");
                    LineOutcome::Mismatch(mismatch)
                }
            };
        }

        if line.ends_with(ITERATION_SUFFIX) {
            outcome = match self.apply_iteration(line) {
                Ok(()) => {
                    let first = self.state == ParserState::AwaitingFirstSample;
                    self.state = ParserState::Streaming;
                    LineOutcome::Progress { first }
                }
                Err(mismatch) => {
                    tracing::warn!(grammar = mismatch.grammar, line = ?mismatch.line, "ignoring progress line");
                    LineOutcome::Mismatch(mismatch)
                }
            };
        }

        outcome
    }

    fn apply_map(&mut self, line: &str) -> Result<(), ParseMismatch> {
        let caps = grammar::captures(&MAP_RE, "mAP summary", line)?;
        self.snapshot.map_iou_threshold = grammar::field(&caps, 1, "mapIouThreshold");
        self.snapshot.map_last = grammar::field::<f64>(&caps, 2, "mapLast") / 100.0;
        self.snapshot.map_best = grammar::field::<f64>(&caps, 3, "mapBest") / 100.0;
        Ok(())
    }

    fn apply_iteration(&mut self, line: &str) -> Result<(), ParseMismatch> {
        let caps = grammar::captures(&ITERATION_RE, "iteration progress", line)?;
        self.snapshot.iteration = grammar::field(&caps, 1, "iteration");
        self.snapshot.loss = grammar::field(&caps, 2, "loss");
        self.snapshot.avg_loss = grammar::field(&caps, 3, "avgLoss");
        self.snapshot.current_rate = grammar::field(&caps, 4, "currentRate");
        self.snapshot.elapsed_seconds = grammar::field(&caps, 5, "elapsedSeconds");
        self.snapshot.images = grammar::field(&caps, 6, "images");
        self.snapshot.hours_left = grammar::field(&caps, 7, "hoursLeft");
        Ok(())
    }
}
