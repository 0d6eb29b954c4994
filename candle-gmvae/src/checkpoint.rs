#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const PARAMS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "checkpoint.json";

/// Which retained snapshot of a run to address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    Latest,
    Best,
    EarlyStopping,
}

impl CheckpointKind {
    fn subdir(&self) -> Option<&'static str> {
        match self {
            CheckpointKind::Latest => None,
            CheckpointKind::Best => Some("best"),
            CheckpointKind::EarlyStopping => Some("early_stopping"),
        }
    }
}

/// Sidecar record persisted with every parameter snapshot. A
/// checkpoint only counts as written once this file exists, so a
/// killed process never leaves a half-valid snapshot behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub global_step: u64,
}

/// The log directory of one training run:
/// `<base>/<model_name>/run_<run_id>/` holding the latest checkpoint,
/// `best/` and `early_stopping/` snapshots, learning curves and
/// evaluation summaries. Only the active training process writes here.
#[derive(Clone, Debug)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    pub fn new(base: &Path, model_name: &str, run_id: &str) -> Self {
        Self {
            root: base.join(model_name).join(format!("run_{}", run_id)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    pub fn kind_dir(&self, kind: CheckpointKind) -> PathBuf {
        match kind.subdir() {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        }
    }

    pub fn params_path(&self, kind: CheckpointKind) -> PathBuf {
        self.kind_dir(kind).join(PARAMS_FILE)
    }

    pub fn meta_path(&self, kind: CheckpointKind) -> PathBuf {
        self.kind_dir(kind).join(META_FILE)
    }

    pub fn learning_curve_path(&self, split: &str) -> PathBuf {
        self.root.join(format!("learning_curves.{}.jsonl", split))
    }

    pub fn evaluation_dir(&self, kind: CheckpointKind) -> PathBuf {
        self.kind_dir(kind).join("evaluation")
    }

    /// Metadata of a snapshot, `None` when it was never (fully)
    /// written.
    pub fn checkpoint_meta(&self, kind: CheckpointKind) -> anyhow::Result<Option<CheckpointMeta>> {
        let meta_path = self.meta_path(kind);
        if !meta_path.exists() || !self.params_path(kind).exists() {
            return Ok(None);
        }
        let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
        Ok(Some(meta))
    }

    /// Atomically persist all trainable parameters plus metadata:
    /// each file lands via a temporary name and rename, parameters
    /// before metadata.
    pub fn save_checkpoint(
        &self,
        varmap: &VarMap,
        kind: CheckpointKind,
        meta: CheckpointMeta,
    ) -> anyhow::Result<()> {
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir)?;

        let params_tmp = dir.join(format!("{}.tmp", PARAMS_FILE));
        varmap.save(&params_tmp)?;
        fs::rename(&params_tmp, self.params_path(kind))?;

        let meta_tmp = dir.join(format!("{}.tmp", META_FILE));
        fs::write(&meta_tmp, serde_json::to_string_pretty(&meta)?)?;
        fs::rename(&meta_tmp, self.meta_path(kind))?;

        Ok(())
    }

    /// Restore parameters from a snapshot into the (shared) variable
    /// map; returns its metadata, or `None` when the snapshot does not
    /// exist.
    pub fn load_checkpoint(
        &self,
        varmap: &VarMap,
        kind: CheckpointKind,
    ) -> anyhow::Result<Option<CheckpointMeta>> {
        let meta = match self.checkpoint_meta(kind)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let mut varmap = varmap.clone();
        varmap.load(self.params_path(kind))?;
        Ok(Some(meta))
    }

    /// Duplicate one snapshot into another role, replacing whatever
    /// was there (at most one file set per role is retained).
    pub fn copy_checkpoint(&self, from: CheckpointKind, to: CheckpointKind) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.checkpoint_meta(from)?.is_some(),
            "no {:?} checkpoint to copy",
            from
        );
        let dir = self.kind_dir(to);
        fs::create_dir_all(&dir)?;
        fs::copy(self.params_path(from), self.params_path(to))?;
        fs::copy(self.meta_path(from), self.meta_path(to))?;
        Ok(())
    }

    pub fn remove_checkpoint(&self, kind: CheckpointKind) -> anyhow::Result<()> {
        match kind.subdir() {
            Some(_) => {
                let dir = self.kind_dir(kind);
                if dir.exists() {
                    fs::remove_dir_all(dir)?;
                }
            }
            None => {
                for path in [self.params_path(kind), self.meta_path(kind)] {
                    if path.exists() {
                        fs::remove_file(path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run ids go into directory names; keep them boring.
pub fn check_run_id(run_id: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        "run id '{}' must be alphanumeric with '-' or '_'",
        run_id
    );
    Ok(())
}

/// An opaque, practically unique run id.
pub fn generate_run_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}_{}", stamp, suffix)
}

/// Recursive directory copy, for staging a run in a temporary
/// location.
pub fn copy_directory(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_directory(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

pub fn clear_directory(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Move a completed staging directory over the permanent location;
/// falls back to copy-and-delete across filesystems.
pub fn replace_directory(src: &Path, dst: &Path) -> anyhow::Result<()> {
    clear_directory(dst)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_err() {
        copy_directory(src, dst)?;
        fs::remove_dir_all(src)?;
    }
    Ok(())
}
