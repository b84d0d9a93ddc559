//! Checkpoint persistence with a bounded rolling history
//!
//! Directory layout:
//!
//! ```text
//! <dir>/ckpt-<epoch>.safetensors        model weights after <epoch> completed epochs
//! <dir>/ckpt-<epoch>.optim.safetensors  optimizer moments for the same epoch
//! <dir>/ckpt_record.json                progress, controller state, epoch -> snapshot map
//! ```
//!
//! A save writes the snapshot files first and the record last, each through a
//! temporary file and a rename, and only then evicts snapshots that fell out
//! of the window. A crash at any point leaves a record whose snapshots exist.
//! Snapshot files the record does not list are swept on the next load.
//!
//! The window holds the `max_to_keep` newest snapshots. The snapshot of the
//! best validation epoch stays outside the window until a better epoch
//! replaces it, so the weights reported as best can always be restored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::early_stop::EarlyStopState;
use super::optimizers::Optimizer;
use super::reshuffle::ReshuffleState;
use super::trainer::TrainingState;
use crate::error::{Error, Result};

/// Record file name inside a checkpoint directory
pub const RECORD_FILE: &str = "ckpt_record.json";

/// One retained weight snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// File stem shared by the weight and optimizer files
    pub stem: String,
    /// Optimizer steps applied when the snapshot was taken
    pub step_count: usize,
}

impl SnapshotInfo {
    /// Weight file name
    pub fn weights_file(&self) -> String {
        format!("{}.safetensors", self.stem)
    }

    /// Optimizer state file name
    pub fn optimizer_file(&self) -> String {
        format!("{}.optim.safetensors", self.stem)
    }
}

/// The small structured record overwritten after every epoch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    /// Completed epochs; training resumes at this 0-based epoch
    pub epoch: usize,
    /// 1-based best validation epoch
    pub best_epoch: usize,
    /// Validation-driven early stopping is active
    pub checkpoint_eligible: bool,
    /// Early stop was signalled
    pub early_stop: bool,
    /// Optimizer steps applied
    pub step_count: usize,
    /// Early-stop controller state
    pub early_stopper: EarlyStopState,
    /// Reshuffle controller state
    pub reshuffler: ReshuffleState,
    /// Retained snapshots keyed by epoch
    pub snapshots: BTreeMap<usize, SnapshotInfo>,
    /// Write time
    pub saved_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Trainer progress captured by the record
    pub fn training_state(&self) -> TrainingState {
        TrainingState {
            epoch: self.epoch,
            step_count: self.step_count,
            early_stop_flag: self.early_stop,
            checkpoint_eligible_flag: self.checkpoint_eligible,
            best_epoch: self.best_epoch,
        }
    }

    /// Read the record in `dir`, `None` when there is none
    pub fn read(dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = dir.as_ref().join(RECORD_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Everything needed to continue a run
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Progress and flags
    pub state: TrainingState,
    /// Early-stop controller state
    pub early_stopper: EarlyStopState,
    /// Reshuffle controller state
    pub reshuffler: ReshuffleState,
}

/// Persists and restores trainer progress with model and optimizer weights
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_to_keep: usize,
    snapshots: BTreeMap<usize, SnapshotInfo>,
}

impl CheckpointStore {
    /// Open the store at `dir`, keeping the `max_to_keep` newest snapshots plus the best one
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        if max_to_keep == 0 {
            return Err(Error::config("checkpoint store must keep at least one snapshot"));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_to_keep,
            snapshots: BTreeMap::new(),
        })
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Retained snapshot epochs, oldest first
    pub fn retained_epochs(&self) -> Vec<usize> {
        self.snapshots.keys().copied().collect()
    }

    /// Oldest retained snapshot epoch
    pub fn oldest_epoch(&self) -> Option<usize> {
        self.snapshots.keys().next().copied()
    }

    /// Newest retained snapshot epoch
    pub fn latest_epoch(&self) -> Option<usize> {
        self.snapshots.keys().next_back().copied()
    }

    /// Weight file of the snapshot for `epoch`, if retained
    pub fn weights_path(&self, epoch: usize) -> Option<PathBuf> {
        self.snapshots.get(&epoch).map(|info| self.dir.join(info.weights_file()))
    }

    /// Whether a snapshot for `epoch` is retained
    pub fn contains(&self, epoch: usize) -> bool {
        self.snapshots.contains_key(&epoch)
    }

    /// Persist a snapshot for `state.epoch` and overwrite the record
    pub fn save(
        &mut self,
        state: &TrainingState,
        early_stopper: &EarlyStopState,
        reshuffler: &ReshuffleState,
        var_map: &VarMap,
        optimizer: &dyn Optimizer,
    ) -> Result<PathBuf> {
        let info = SnapshotInfo {
            stem: format!("ckpt-{}", state.epoch),
            step_count: state.step_count,
        };

        let weights_path = self.dir.join(info.weights_file());
        write_atomic(&weights_path, |tmp| Ok(var_map.save(tmp)?))?;
        let optimizer_state = optimizer.state_tensors();
        write_atomic(&self.dir.join(info.optimizer_file()), |tmp| {
            Ok(candle_core::safetensors::save(&optimizer_state, tmp)?)
        })?;

        let mut snapshots = self.snapshots.clone();
        snapshots.insert(state.epoch, info);
        let mut evicted = Vec::new();
        if let Some(&window_start) = snapshots.keys().rev().nth(self.max_to_keep - 1) {
            let stale: Vec<usize> = snapshots
                .keys()
                .copied()
                .filter(|&epoch| epoch < window_start && epoch != state.best_epoch)
                .collect();
            for epoch in stale {
                if let Some(info) = snapshots.remove(&epoch) {
                    evicted.push((epoch, info));
                }
            }
        }

        let record = CheckpointRecord {
            epoch: state.epoch,
            best_epoch: state.best_epoch,
            checkpoint_eligible: state.checkpoint_eligible_flag,
            early_stop: state.early_stop_flag,
            step_count: state.step_count,
            early_stopper: early_stopper.clone(),
            reshuffler: reshuffler.clone(),
            snapshots: snapshots.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        write_atomic(&self.dir.join(RECORD_FILE), |tmp| Ok(fs::write(tmp, &json)?))?;
        self.snapshots = snapshots;

        for (epoch, info) in evicted {
            debug!(epoch, "evicting checkpoint");
            for file in [info.weights_file(), info.optimizer_file()] {
                if let Err(e) = fs::remove_file(self.dir.join(&file)) {
                    warn!("failed to remove evicted checkpoint {}: {}", file, e);
                }
            }
        }

        Ok(weights_path)
    }

    /// Restore the newest snapshot named by the record, `None` for a fresh start
    pub fn load(&mut self, var_map: &mut VarMap, optimizer: &mut dyn Optimizer) -> Result<Option<ResumePoint>> {
        let Some(record) = CheckpointRecord::read(&self.dir)? else {
            info!("no checkpoint record in {}, starting fresh", self.dir.display());
            return Ok(None);
        };
        if !record.snapshots.contains_key(&record.epoch) {
            return Err(Error::checkpoint(format!(
                "record for epoch {} has no matching snapshot",
                record.epoch
            )));
        }

        self.snapshots = record.snapshots.clone();
        self.restore(record.epoch, var_map, optimizer)?;
        self.sweep_unlisted()?;

        Ok(Some(ResumePoint {
            state: record.training_state(),
            early_stopper: record.early_stopper,
            reshuffler: record.reshuffler,
        }))
    }

    /// Remove snapshot files left behind by a save that stopped before eviction
    fn sweep_unlisted(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(epoch) = snapshot_epoch(&name) else {
                continue;
            };
            if self.snapshots.contains_key(&epoch) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => debug!(epoch, file = %name, "removed unlisted checkpoint"),
                Err(e) => warn!("failed to remove unlisted checkpoint {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// Load the weights and optimizer state of the snapshot taken after `epoch`
    pub fn restore(&self, epoch: usize, var_map: &mut VarMap, optimizer: &mut dyn Optimizer) -> Result<()> {
        let info = self
            .snapshots
            .get(&epoch)
            .ok_or_else(|| Error::checkpoint(format!("no retained snapshot for epoch {epoch}")))?;

        var_map.load(self.dir.join(info.weights_file()))?;
        let moments = candle_core::safetensors::load(self.dir.join(info.optimizer_file()), &Device::Cpu)?;
        optimizer.load_state_tensors(moments, info.step_count)?;
        debug!(epoch, "restored checkpoint");
        Ok(())
    }
}

/// Name, dtype and shape of one stored tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSummary {
    /// Tensor name
    pub name: String,
    /// Stored dtype
    pub dtype: String,
    /// Shape
    pub shape: Vec<usize>,
}

/// List the tensors of a safetensors file, sorted by name
pub fn read_snapshot_header(path: impl AsRef<Path>) -> Result<Vec<TensorSummary>> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let tensors = safetensors::SafeTensors::deserialize(&bytes)
        .map_err(|e| Error::checkpoint(format!("invalid snapshot {}: {e:?}", path.display())))?;
    let mut summaries: Vec<TensorSummary> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorSummary {
            name,
            dtype: format!("{:?}", view.dtype()),
            shape: view.shape().to_vec(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

/// Epoch of a `ckpt-<epoch>.safetensors` or `ckpt-<epoch>.optim.safetensors` file name
fn snapshot_epoch(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("ckpt-")?;
    let epoch = rest
        .strip_suffix(".optim.safetensors")
        .or_else(|| rest.strip_suffix(".safetensors"))?;
    epoch.parse().ok()
}

fn write_atomic(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .ok_or_else(|| Error::internal(format!("invalid checkpoint path {}", path.display())))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    write(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
