#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Scalar metrics of one split after one epoch; appended to the run's
/// learning-curve store and read back on resume.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub lower_bound: f32,
    pub reconstruction_error: f32,
    pub kl_divergence_z: f32,
    pub kl_divergence_y: f32,
    pub clf_error: f32,
    pub accuracy: Option<f32>,
    pub kl_divergence_z_clusters: Vec<f32>,
}

/// Append one record; the store is a JSON-lines file, append-only
/// during training.
pub fn append_record(path: &Path, record: &EpochRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

pub fn load_records(path: &Path) -> anyhow::Result<Vec<EpochRecord>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut records = vec![];
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Truncate records at or beyond `epoch`, so a resumed run never keeps
/// curve entries the restored checkpoint has not seen.
pub fn truncate_after(path: &Path, epoch: usize) -> anyhow::Result<()> {
    let records = load_records(path)?;
    let kept: Vec<&EpochRecord> = records.iter().filter(|r| r.epoch < epoch).collect();
    if kept.len() == records.len() {
        return Ok(());
    }
    let mut out = String::new();
    for r in kept {
        out.push_str(&serde_json::to_string(r)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Early-stopping bookkeeping, recoverable from the persisted
/// validation curve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EarlyStoppingState {
    pub stopped_early: bool,
    pub epochs_with_no_improvement: usize,
    /// best validation lower bound ever seen; governs the "best"
    /// checkpoint rule
    pub best_lower_bound: f64,
    /// comparison reference for the no-improvement counter
    pub reference_lower_bound: f64,
}

impl Default for EarlyStoppingState {
    fn default() -> Self {
        Self {
            stopped_early: false,
            epochs_with_no_improvement: 0,
            best_lower_bound: f64::NEG_INFINITY,
            reference_lower_bound: f64::NEG_INFINITY,
        }
    }
}

/// What the orchestrator must do with the early-stopping snapshot
/// after observing one validation epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EarlyStoppingAction {
    /// first non-improving epoch: freeze the pre-degradation
    /// checkpoint
    Snapshot,
    /// validation did not degrade; any stale snapshot is obsolete
    Discard,
    None,
}

impl EarlyStoppingState {
    /// Track the best-ever validation bound; returns whether this
    /// epoch set a new best.
    pub fn observe_best(&mut self, lower_bound: f64) -> bool {
        if lower_bound > self.best_lower_bound {
            self.best_lower_bound = lower_bound;
            true
        } else {
            false
        }
    }

    /// Advance the no-improvement counter. Once `stopped_early` is
    /// set it stays set and the stored snapshot is left untouched.
    pub fn observe(&mut self, lower_bound: f64, rounds: usize) -> EarlyStoppingAction {
        if self.stopped_early {
            return EarlyStoppingAction::None;
        }
        if lower_bound < self.reference_lower_bound {
            let action = if self.epochs_with_no_improvement == 0 {
                self.reference_lower_bound = lower_bound;
                EarlyStoppingAction::Snapshot
            } else {
                EarlyStoppingAction::None
            };
            self.epochs_with_no_improvement += 1;
            if self.epochs_with_no_improvement >= rounds {
                self.stopped_early = true;
            }
            action
        } else {
            self.epochs_with_no_improvement = 0;
            self.reference_lower_bound = lower_bound;
            EarlyStoppingAction::Discard
        }
    }
}

/// Rebuild the early-stopping state a resumed run would have had, by
/// replaying the persisted validation curve through the same
/// transition rule. Called once at run start; the training loop never
/// inspects log files itself.
pub fn recover_early_stopping_state(
    records: &[EpochRecord],
    rounds: usize,
) -> EarlyStoppingState {
    let mut state = EarlyStoppingState::default();
    for record in records {
        let v = record.lower_bound as f64;
        state.observe_best(v);
        state.observe(v, rounds);
    }
    state
}
