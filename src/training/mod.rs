//! Training orchestration for STSAN-XL
//!
//! This module drives data-parallel training of a spatio-temporal flow model:
//! replicated gradient steps, two-phase early stopping, periodic reshuffling
//! of the training split, checkpoint/resume, and autoregressive multi-horizon
//! evaluation with trivial-cell masking.
//!
//! # Main Components
//!
//! - **Trainer**: the epoch loop and its phase machine
//! - **Distributed**: replicated train step and gradient reduction
//! - **Evaluator**: autoregressive decoding and per-horizon metrics
//! - **Checkpoints**: atomic, bounded snapshot history with a progress record
//! - **Early stop / Reshuffle**: per-epoch controllers
//! - **Metrics**: accumulators, result log and telemetry
//! - **Optimizers**: Adam with the Transformer warm-up schedule
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stsan_trainer::config::TrainerConfig;
//! use stsan_trainer::training::{ReplicaTopology, StsanTrainer};
//!
//! let config = TrainerConfig::from_file("taxi.yaml")?;
//! let topology = ReplicaTopology::detect(config.settings().replicas);
//! let mut trainer = StsanTrainer::new(config, model, var_map, provider, topology)?;
//! let report = trainer.run()?;
//! ```

pub mod checkpoints;
pub mod data;
pub mod distributed;
pub mod early_stop;
pub mod evaluator;
pub mod loss;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod optimizers;
pub mod reshuffle;
pub mod trainer;

#[cfg(test)]
pub mod tests;

// Trainer re-exports
pub use trainer::{EpochOutcome, StsanTrainer, TrainerPhase, TrainingReport, TrainingState};

// Component re-exports
pub use checkpoints::{CheckpointRecord, CheckpointStore, ResumePoint};
pub use data::{Batch, BatchSource, BuildOptions, DatasetProvider, InputBundle, SplitData, TargetBundle};
pub use distributed::{DistributedExecutor, ReplicaTopology, StepContext};
pub use early_stop::{EarlyStopController, EarlyStopState, Phase};
pub use evaluator::MultiHorizonEvaluator;
pub use masks::{create_masks, AttentionMasks};
pub use metrics::{Direction, HorizonMetrics, TrainMetrics};
pub use model::{FlowModel, ModelInputs, ModelOutput};
pub use reshuffle::{ReshuffleController, ReshuffleState};
