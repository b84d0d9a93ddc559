//! Epoch-level training driver
//!
//! [`StsanTrainer`] owns the model parameters, the optimizer, both controllers
//! and the checkpoint store, and moves through the phases of
//! [`TrainerPhase`]. One call to [`StsanTrainer::run`] resumes from the latest
//! checkpoint (if any), trains until early stopping or the epoch cap, restores
//! the weights chosen for reporting and runs the final test pass.

use std::fmt;
use std::time::Instant;

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::checkpoints::CheckpointStore;
use super::data::{BatchSource, BuildOptions, DatasetProvider, SplitData};
use super::distributed::{DistributedExecutor, ReplicaTopology, StepContext};
use super::early_stop::EarlyStopController;
use super::evaluator::MultiHorizonEvaluator;
use super::metrics::{
    Direction, HorizonMetrics, JsonlTelemetry, MetricAccumulator, ResultLog, TelemetrySink,
    TrainMetrics,
};
use super::model::FlowModel;
use super::optimizers::{Adam, AdamParams, Optimizer, TransformerSchedule};
use super::reshuffle::ReshuffleController;
use crate::config::{Split, TrainerConfig};
use crate::error::{Error, Result};

/// Batches between training progress log lines
const PROGRESS_INTERVAL: usize = 100;

/// Persisted trainer progress
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrainingState {
    /// Completed epochs, i.e. the 0-based epoch to run next
    pub epoch: usize,
    /// Optimizer steps applied so far
    pub step_count: usize,
    /// Early stopping was signalled
    pub early_stop_flag: bool,
    /// Validation-driven early stopping is active
    pub checkpoint_eligible_flag: bool,
    /// 1-based epoch with the best validation score, 0 before validation
    pub best_epoch: usize,
}

/// Driver phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    /// Loading the checkpoint record
    Resuming,
    /// Running replicated steps over the training split
    Training,
    /// Evaluating the validation (or periodic test) split
    Validating,
    /// Rebuilding the training split
    Reshuffling,
    /// Persisting state after an epoch
    Checkpointing,
    /// Restoring the weights used for reporting
    Stopping,
    /// Final test pass with all metrics
    FinalTesting,
}

impl fmt::Display for TrainerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainerPhase::Resuming => "resuming",
            TrainerPhase::Training => "training",
            TrainerPhase::Validating => "validating",
            TrainerPhase::Reshuffling => "reshuffling",
            TrainerPhase::Checkpointing => "checkpointing",
            TrainerPhase::Stopping => "stopping",
            TrainerPhase::FinalTesting => "final-testing",
        };
        f.write_str(name)
    }
}

/// What happened in one completed epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochOutcome {
    /// 0-based epoch
    pub epoch: usize,
    /// Mean of the per-step training losses
    pub mean_loss: f64,
    /// Validation score, when validation ran
    pub validation_score: Option<f64>,
    /// Early stopping was signalled by this epoch's check
    pub early_stop: bool,
    /// The training split was rebuilt after this epoch
    pub reshuffled: bool,
}

impl EpochOutcome {
    /// Whether validation ran in this epoch
    pub fn validated(&self) -> bool {
        self.validation_score.is_some()
    }
}

/// Result of [`StsanTrainer::run`]
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// State after the last completed epoch
    pub state: TrainingState,
    /// Epoch the run resumed at, if a checkpoint was found
    pub resumed_from: Option<usize>,
    /// Snapshot epoch restored for the final test; `None` kept the current weights
    pub restored_epoch: Option<usize>,
    /// Epochs completed by this call, in order
    pub epochs: Vec<EpochOutcome>,
    /// Final test metrics, including MAE and MAPE
    pub final_metrics: HorizonMetrics,
}

/// Training loop driver for a flow model and its dataset provider
pub struct StsanTrainer<M: FlowModel, P: DatasetProvider> {
    config: TrainerConfig,
    model: M,
    var_map: VarMap,
    optimizer: Box<dyn Optimizer>,
    provider: P,
    executor: DistributedExecutor,
    evaluator: MultiHorizonEvaluator,
    early_stopper: EarlyStopController,
    reshuffler: ReshuffleController,
    checkpoints: CheckpointStore,
    results: ResultLog,
    telemetry: Box<dyn TelemetrySink>,
    state: TrainingState,
    phase: TrainerPhase,
    train_metrics: TrainMetrics,
    eval_metrics: HorizonMetrics,
}

impl<M: FlowModel, P: DatasetProvider> StsanTrainer<M, P> {
    /// Create a trainer over `model`, whose parameters are registered in `var_map`
    pub fn new(
        config: TrainerConfig,
        model: M,
        var_map: VarMap,
        provider: P,
        topology: ReplicaTopology,
    ) -> Result<Self> {
        let settings = config.settings();
        if topology.replicas() != settings.replicas {
            return Err(Error::config(format!(
                "topology has {} replicas but the configuration expects {}",
                topology.replicas(),
                settings.replicas
            )));
        }

        let schedule = TransformerSchedule::new(settings.d_model, settings.warmup_steps);
        let optimizer = Adam::new(&var_map, AdamParams::default(), Box::new(schedule))?;
        info!(
            optimizer = optimizer.name(),
            schedule = optimizer.schedule_name(),
            parameters = optimizer.parameter_count(),
            "optimizer ready"
        );
        let executor = DistributedExecutor::new(topology, var_map.all_vars());
        let evaluator =
            MultiHorizonEvaluator::new(config.n_pred(), config.test_threshold(), settings.replicas);
        let early_stopper = EarlyStopController::new(config.es_patiences(), settings.es_threshold);
        let reshuffler = ReshuffleController::new(config.es_patiences()[0], config.reshuffle_tiers());
        let checkpoints = CheckpointStore::new(config.checkpoint_path(), config.checkpoints_to_keep())?;
        let results = ResultLog::new(config.result_path())?;
        let telemetry = JsonlTelemetry::new(config.telemetry_path())?;
        let eval_metrics = HorizonMetrics::new(config.n_pred());

        Ok(Self {
            config,
            model,
            var_map,
            optimizer: Box::new(optimizer),
            provider,
            executor,
            evaluator,
            early_stopper,
            reshuffler,
            checkpoints,
            results,
            telemetry: Box::new(telemetry),
            state: TrainingState::default(),
            phase: TrainerPhase::Resuming,
            train_metrics: TrainMetrics::default(),
            eval_metrics,
        })
    }

    /// Replace the telemetry sink
    pub fn with_telemetry(mut self, telemetry: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Configuration
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Current progress
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Current phase
    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Model parameters
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Model
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Dataset provider
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Result log
    pub fn results(&self) -> &ResultLog {
        &self.results
    }

    /// Checkpoint store
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Resume, train, restore and run the final test
    #[instrument(skip(self), fields(run_id = %self.config.settings().run_id))]
    pub fn run(&mut self) -> Result<TrainingReport> {
        self.transition(TrainerPhase::Resuming);
        let resumed_from = self.resume()?;

        let options = self.build_options();
        let test_split = self.provider.build(Split::Test, &options)?.batches;
        let (mut train_split, mut validation_split) = self.build_train()?;

        self.results.write("Start training...")?;
        let mut epochs = Vec::new();
        let max_epoch = self.config.settings().max_epoch;

        let restored_epoch = loop {
            let epoch = self.state.epoch;
            if self.state.early_stop_flag || epoch >= max_epoch {
                self.transition(TrainerPhase::Stopping);
                break self.restore_for_final()?;
            }

            let outcome = self.run_epoch(
                epoch,
                train_split.as_ref(),
                validation_split.as_ref(),
                test_split.as_ref(),
            )?;

            if outcome.reshuffled {
                (train_split, validation_split) = self.build_train()?;
            }

            self.state.epoch = epoch + 1;
            self.transition(TrainerPhase::Checkpointing);
            self.checkpoints.save(
                &self.state,
                self.early_stopper.state(),
                self.reshuffler.state(),
                &self.var_map,
                self.optimizer.as_ref(),
            )?;
            if self.config.settings().test_model {
                self.state.early_stop_flag = true;
            }
            epochs.push(outcome);
        };

        self.transition(TrainerPhase::FinalTesting);
        self.results.write("Start testing (filtering out trivial grids):")?;
        self.evaluator
            .evaluate(&self.model, test_split.as_ref(), &mut self.eval_metrics, true)?;
        let flow_max = self.config.settings().flow_max;
        self.results.write(&self.eval_metrics.format_final(flow_max))?;
        self.telemetry
            .scalar("final_in_rmse", self.eval_metrics.rmse(0, Direction::Inflow), 1)?;
        self.telemetry
            .scalar("final_out_rmse", self.eval_metrics.rmse(0, Direction::Outflow), 1)?;
        self.telemetry.flush()?;

        info!(
            epochs = self.state.epoch,
            steps = self.state.step_count,
            best_epoch = self.state.best_epoch,
            "training finished"
        );

        Ok(TrainingReport {
            state: self.state.clone(),
            resumed_from,
            restored_epoch,
            epochs,
            final_metrics: self.eval_metrics.clone(),
        })
    }

    #[instrument(skip_all, fields(epoch = epoch + 1))]
    fn run_epoch(
        &mut self,
        epoch: usize,
        train_split: &dyn BatchSource,
        validation_split: &dyn BatchSource,
        test_split: &dyn BatchSource,
    ) -> Result<EpochOutcome> {
        let started = Instant::now();
        let settings = self.config.settings().clone();

        self.transition(TrainerPhase::Training);
        let mean_loss = self.train_epoch(epoch, train_split)?;

        let (in_rmse, out_rmse) = (self.train_metrics.inflow.result(), self.train_metrics.outflow.result());
        if settings.verbose_train {
            self.results.write(&format!(
                "Epoch {} in_RMSE {:.6} out_RMSE {:.6}",
                epoch + 1,
                in_rmse,
                out_rmse
            ))?;
        }
        self.telemetry.scalar("in_rmse_train", in_rmse, epoch + 1)?;
        self.telemetry.scalar("out_rmse_train", out_rmse, epoch + 1)?;

        if self.early_stopper.refresh_status(self.train_metrics.mean_rmse()) {
            info!(epoch = epoch + 1, "training score improved, validation starts");
            self.state.checkpoint_eligible_flag = true;
        }

        let mut validation_score = None;
        let mut early_stop = false;
        if self.state.checkpoint_eligible_flag || settings.test_model {
            self.transition(TrainerPhase::Validating);
            self.evaluator
                .evaluate(&self.model, validation_split, &mut self.eval_metrics, false)?;
            self.results.write(&format!(
                "Validation Result (Min-Max Norm, filtering out trivial grids):\n{}",
                self.eval_metrics.format_epoch(epoch)
            ))?;

            let score = self.eval_metrics.validation_score();
            early_stop = self.early_stopper.check(score, epoch);
            self.state.early_stop_flag = early_stop;
            self.state.best_epoch = self.early_stopper.get_best_epoch();
            validation_score = Some(score);

            self.telemetry
                .scalar("in_rmse_test", self.eval_metrics.rmse(0, Direction::Inflow), epoch + 1)?;
            self.telemetry
                .scalar("out_rmse_test", self.eval_metrics.rmse(0, Direction::Outflow), epoch + 1)?;
            self.telemetry
                .scalar("best_epoch", self.state.best_epoch as f64, epoch + 1)?;
            if early_stop {
                info!(epoch = epoch + 1, best_epoch = self.state.best_epoch, "early stopping signalled");
            }

            if settings.always_test > 0 && (epoch + 1) % settings.always_test == 0 {
                self.evaluator
                    .evaluate(&self.model, test_split, &mut self.eval_metrics, false)?;
                self.results
                    .write(&format!("Always Test:\n{}", self.eval_metrics.format_epoch(epoch)))?;
            }
        }

        let reshuffle_due = self.reshuffler.check(epoch);
        let reshuffled = reshuffle_due || settings.test_model;
        if reshuffled {
            self.transition(TrainerPhase::Reshuffling);
        }

        self.telemetry
            .scalar("epoch_time", started.elapsed().as_secs_f64(), epoch + 1)?;

        Ok(EpochOutcome {
            epoch,
            mean_loss,
            validation_score,
            early_stop,
            reshuffled,
        })
    }

    fn train_epoch(&mut self, epoch: usize, batches: &dyn BatchSource) -> Result<f64> {
        self.train_metrics.reset();
        let n_pred = self.config.n_pred();
        let verbose = self.config.settings().verbose_train;
        let ctx = StepContext {
            model: &self.model,
            loss_weights: self.config.loss_weights(),
            global_batch_size: self.config.global_batch_size(),
        };

        let mut total_loss = 0.0;
        let mut steps = 0usize;
        for batch in batches.batches() {
            let batch = batch?;
            batch.validate(n_pred)?;

            let step = self.state.step_count + 1;
            let loss = self.executor.distributed_train_step(
                ctx,
                self.optimizer.as_mut(),
                &batch,
                &mut self.train_metrics,
                step,
            )?;
            self.state.step_count = step;
            self.telemetry.scalar("total_loss", loss, step)?;
            total_loss += loss;
            steps += 1;

            if verbose && steps % PROGRESS_INTERVAL == 0 {
                info!(
                    epoch = epoch + 1,
                    batch = steps,
                    loss,
                    in_rmse = self.train_metrics.inflow.result(),
                    out_rmse = self.train_metrics.outflow.result(),
                    lr = self.optimizer.learning_rate(),
                    "training progress"
                );
            }
        }

        if steps == 0 {
            return Err(Error::dataset("training split yielded no batches"));
        }
        Ok(total_loss / steps as f64)
    }

    fn resume(&mut self) -> Result<Option<usize>> {
        let Some(point) = self.checkpoints.load(&mut self.var_map, self.optimizer.as_mut())? else {
            return Ok(None);
        };

        let settings = self.config.settings();
        self.early_stopper = EarlyStopController::with_state(
            self.config.es_patiences(),
            settings.es_threshold,
            point.early_stopper,
        );
        self.reshuffler = ReshuffleController::with_state(
            self.config.es_patiences()[0],
            self.config.reshuffle_tiers(),
            point.reshuffler,
        );
        self.state = point.state;
        self.results
            .write(&format!("Check point restored at epoch {}", self.state.epoch))?;
        Ok(Some(self.state.epoch))
    }

    /// Restore the best epoch's snapshot; an early stop falls back to the oldest retained one
    fn restore_for_final(&mut self) -> Result<Option<usize>> {
        let best_epoch = self.state.best_epoch;
        let target = if best_epoch > 0 && self.checkpoints.contains(best_epoch) {
            Some(best_epoch)
        } else if self.state.early_stop_flag {
            warn!(best_epoch, "best epoch snapshot is not retained, restoring the oldest one");
            self.checkpoints.oldest_epoch()
        } else {
            if best_epoch > 0 {
                warn!(best_epoch, "best epoch snapshot is not retained, keeping the latest weights");
            }
            None
        };

        if let Some(epoch) = target {
            self.checkpoints
                .restore(epoch, &mut self.var_map, self.optimizer.as_mut())?;
            info!(epoch, "restored weights for final testing");
        }
        Ok(target)
    }

    fn build_options(&self) -> BuildOptions {
        let settings = self.config.settings();
        BuildOptions {
            reuse_saved: settings.load_saved_data,
            replicas: settings.replicas,
            revert: settings.st_revert,
            no_save: settings.no_save,
        }
    }

    fn build_train(&mut self) -> Result<(Box<dyn BatchSource>, Box<dyn BatchSource>)> {
        let options = self.build_options();
        let SplitData { batches, validation } = self.provider.build(Split::Train, &options)?;
        let validation =
            validation.ok_or_else(|| Error::dataset("training split was built without a validation set"))?;
        Ok((batches, validation))
    }

    fn transition(&mut self, next: TrainerPhase) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "phase transition");
            self.phase = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(TrainerPhase::FinalTesting.to_string(), "final-testing");
        assert_eq!(TrainerPhase::Resuming.to_string(), "resuming");
    }

    #[test]
    fn test_state_serde() {
        let state = TrainingState {
            epoch: 4,
            step_count: 120,
            early_stop_flag: false,
            checkpoint_eligible_flag: true,
            best_epoch: 3,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: TrainingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
