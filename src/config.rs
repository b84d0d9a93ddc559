//! Configuration structures for the STSAN-XL trainer
//!
//! [`TrainerSettings`] is the raw hyperparameter set as it appears on disk.
//! [`TrainerConfig`] is the validated, immutable snapshot the trainer runs
//! with; its derived fields are computed once in [`TrainerConfig::new`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Patience of the coarse early-stop phase
pub const COARSE_PATIENCE: usize = 5;

/// Flow volume below which a grid cell is treated as trivial, in raw units
pub const TRIVIAL_FLOW: f64 = 10.0;

/// Crowd-flow dataset the run is trained on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// NYC taxi demand
    Taxi,
    /// NYC bike demand
    Bike,
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "taxi" => Ok(Self::Taxi),
            "bike" => Ok(Self::Bike),
            other => Err(Error::config(format!("unsupported dataset '{other}', expected taxi or bike"))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Taxi => write!(f, "taxi"),
            Self::Bike => write!(f, "bike"),
        }
    }
}

/// Dataset split requested from a provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training split, built together with its validation split
    Train,
    /// Held-out test split
    Test,
}

impl FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            other => Err(Error::config(format!("unsupported split '{other}'"))),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Raw trainer hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    /// Identifier used to key result logs, checkpoints and telemetry
    pub run_id: String,
    /// Dataset to train on
    pub dataset: DatasetKind,
    /// Per-replica batch size
    pub batch_size: usize,
    /// Number of data-parallel replicas
    pub replicas: usize,
    /// Weekly history intervals
    pub n_hist_week: usize,
    /// Daily history intervals
    pub n_hist_day: usize,
    /// Intervals taken around each historical anchor
    pub n_hist_int: usize,
    /// Current intervals
    pub n_curr_int: usize,
    /// Intervals before the anchor
    pub n_int_before: usize,
    /// Number of predicted horizons
    pub n_pred: usize,
    /// Local block side length
    pub local_block_len: usize,
    /// Global block side length
    pub local_block_len_g: usize,
    /// Shuffle samples before batching
    pub pre_shuffle: bool,
    /// Model width
    pub d_model: usize,
    /// Attention layers
    pub num_layers: usize,
    /// Attention heads
    pub num_heads: usize,
    /// Feed-forward width
    pub dff: usize,
    /// Convolution layers
    pub cnn_layers: usize,
    /// Convolution filters
    pub cnn_filters: usize,
    /// Dropout rate
    pub dropout_rate: f64,
    /// Learning-rate warm-up steps
    pub warmup_steps: usize,
    /// Weight of the first-horizon loss term; `None` weighs all horizons equally
    pub weight_1: Option<f64>,
    /// Patience of the fine early-stop phase
    pub es_patience: usize,
    /// Minimum improvement counted by the early-stop controller
    pub es_threshold: f64,
    /// Reuse previously generated dataset files
    pub load_saved_data: bool,
    /// Reverse the spatio-temporal order of the inputs
    pub st_revert: bool,
    /// Do not persist generated dataset files
    pub no_save: bool,
    /// Epoch cap
    pub max_epoch: usize,
    /// Emit per-batch and per-epoch training metrics
    pub verbose_train: bool,
    /// Evaluate the test split every N epochs once validating (0 disables)
    pub always_test: usize,
    /// Smoke-test mode: validate and reshuffle every epoch, stop after one
    pub test_model: bool,
    /// Maximum training flow used for min-max normalisation
    pub flow_max: f64,
    /// Output locations
    pub output: OutputConfig,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            run_id: "0".to_string(),
            dataset: DatasetKind::Taxi,
            batch_size: 64,
            replicas: 1,
            n_hist_week: 1,
            n_hist_day: 3,
            n_hist_int: 1,
            n_curr_int: 1,
            n_int_before: 0,
            n_pred: 6,
            local_block_len: 3,
            local_block_len_g: 5,
            pre_shuffle: true,
            d_model: 64,
            num_layers: 4,
            num_heads: 8,
            dff: 128,
            cnn_layers: 3,
            cnn_filters: 64,
            dropout_rate: 0.1,
            warmup_steps: 4000,
            weight_1: None,
            es_patience: 10,
            es_threshold: 0.01,
            load_saved_data: false,
            st_revert: false,
            no_save: false,
            max_epoch: 500,
            verbose_train: true,
            always_test: 0,
            test_model: false,
            flow_max: 0.0,
            output: OutputConfig::default(),
        }
    }
}

impl TrainerSettings {
    /// Load settings from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            other => Err(Error::config(format!(
                "unsupported configuration format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

/// Output directories; each run writes beneath them keyed by its run id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Text result logs
    pub results_dir: PathBuf,
    /// Checkpoint directories
    pub checkpoint_dir: PathBuf,
    /// Scalar telemetry
    pub telemetry_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results/stsan_xl"),
            checkpoint_dir: PathBuf::from("checkpoints/stsan_xl"),
            telemetry_dir: PathBuf::from("runs/stsan_xl"),
        }
    }
}

/// Validated, immutable trainer configuration
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    settings: TrainerSettings,
    seq_len: usize,
    weight_2: Option<f64>,
    global_batch_size: usize,
    es_patiences: [usize; 2],
    reshuffle_tiers: Vec<f64>,
    test_threshold: f64,
}

impl TrainerConfig {
    /// Validate settings and compute derived fields
    pub fn new(settings: TrainerSettings) -> Result<Self> {
        if settings.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if settings.replicas == 0 {
            return Err(Error::config("replicas must be > 0"));
        }
        if settings.n_pred == 0 {
            return Err(Error::config("n_pred must be > 0"));
        }
        if settings.n_hist_int == 0 && settings.n_curr_int == 0 {
            return Err(Error::config("input sequence would be empty"));
        }
        if !(settings.flow_max.is_finite() && settings.flow_max > 0.0) {
            return Err(Error::config("flow_max must be a positive number"));
        }
        if settings.es_threshold < 0.0 {
            return Err(Error::config("es_threshold must be >= 0"));
        }
        if settings.run_id.is_empty() {
            return Err(Error::config("run_id must not be empty"));
        }
        let weight_2 = match settings.weight_1 {
            Some(w) if w > 0.0 && w < 1.0 => Some(1.0 - w),
            Some(w) => return Err(Error::config(format!("weight_1 must lie in (0, 1), got {w}"))),
            None => None,
        };

        let seq_len = (settings.n_hist_week + settings.n_hist_day) * settings.n_hist_int
            + settings.n_curr_int;
        let global_batch_size = settings.batch_size * settings.replicas;
        let es_patiences = [COARSE_PATIENCE, settings.es_patience];
        let test_threshold = TRIVIAL_FLOW / settings.flow_max;

        Ok(Self {
            settings,
            seq_len,
            weight_2,
            global_batch_size,
            es_patiences,
            reshuffle_tiers: vec![2.0],
            test_threshold,
        })
    }

    /// Load, validate and derive from a settings file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(TrainerSettings::from_file(path)?)
    }

    /// Raw settings
    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Encoder sequence length
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Number of predicted horizons
    pub fn n_pred(&self) -> usize {
        self.settings.n_pred
    }

    /// Near/far horizon loss weights, when weighting is enabled
    pub fn loss_weights(&self) -> Option<(f64, f64)> {
        self.settings.weight_1.zip(self.weight_2)
    }

    /// Batch size summed over all replicas
    pub fn global_batch_size(&self) -> usize {
        self.global_batch_size
    }

    /// Coarse and fine early-stop patience
    pub fn es_patiences(&self) -> [usize; 2] {
        self.es_patiences
    }

    /// Reshuffle period multipliers
    pub fn reshuffle_tiers(&self) -> &[f64] {
        &self.reshuffle_tiers
    }

    /// Normalised ground-truth value at or below which cells are ignored
    pub fn test_threshold(&self) -> f64 {
        self.test_threshold
    }

    /// Snapshots retained by the checkpoint store
    pub fn checkpoints_to_keep(&self) -> usize {
        self.settings.es_patience + 1
    }

    /// Result log for this run
    pub fn result_path(&self) -> PathBuf {
        self.settings
            .output
            .results_dir
            .join(format!("{}.txt", self.settings.run_id))
    }

    /// Checkpoint directory for this run
    pub fn checkpoint_path(&self) -> PathBuf {
        self.settings.output.checkpoint_dir.join(&self.settings.run_id)
    }

    /// Scalar telemetry file for this run
    pub fn telemetry_path(&self) -> PathBuf {
        self.settings
            .output
            .telemetry_dir
            .join(&self.settings.run_id)
            .join("scalars.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TrainerSettings {
        TrainerSettings {
            flow_max: 1000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_derived_fields() {
        let mut s = settings();
        s.n_hist_week = 1;
        s.n_hist_day = 3;
        s.n_hist_int = 3;
        s.n_curr_int = 1;
        s.batch_size = 16;
        s.replicas = 2;
        s.weight_1 = Some(0.75);
        let config = TrainerConfig::new(s).unwrap();

        assert_eq!(config.seq_len(), 13);
        assert_eq!(config.global_batch_size(), 32);
        assert_eq!(config.loss_weights(), Some((0.75, 0.25)));
        assert_eq!(config.es_patiences(), [COARSE_PATIENCE, 10]);
        assert_eq!(config.checkpoints_to_keep(), 11);
        assert!((config.test_threshold() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_unweighted_loss() {
        let config = TrainerConfig::new(settings()).unwrap();
        assert_eq!(config.loss_weights(), None);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let mut s = settings();
        s.flow_max = 0.0;
        assert!(matches!(TrainerConfig::new(s), Err(Error::Config(_))));

        let mut s = settings();
        s.weight_1 = Some(1.5);
        assert!(TrainerConfig::new(s).is_err());

        let mut s = settings();
        s.replicas = 0;
        assert!(TrainerConfig::new(s).is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("bike".parse::<DatasetKind>().unwrap(), DatasetKind::Bike);
        assert!("metro".parse::<DatasetKind>().is_err());
        assert_eq!("test".parse::<Split>().unwrap(), Split::Test);
        assert!("validation".parse::<Split>().is_err());
    }

    #[test]
    fn test_run_paths() {
        let mut s = settings();
        s.run_id = "7".to_string();
        let config = TrainerConfig::new(s).unwrap();
        assert_eq!(config.result_path(), PathBuf::from("results/stsan_xl/7.txt"));
        assert_eq!(config.checkpoint_path(), PathBuf::from("checkpoints/stsan_xl/7"));
        assert_eq!(
            config.telemetry_path(),
            PathBuf::from("runs/stsan_xl/7/scalars.jsonl")
        );
    }

    #[test]
    fn test_yaml_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "dataset: bike\nflow_max: 299.0\nn_pred: 3\n").unwrap();

        let config = TrainerConfig::from_file(&path).unwrap();
        assert_eq!(config.settings().dataset, DatasetKind::Bike);
        assert_eq!(config.n_pred(), 3);
    }
}
