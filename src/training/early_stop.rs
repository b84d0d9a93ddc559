//! Two-phase early stopping
//!
//! Before validation starts, [`EarlyStopController::refresh_status`] watches the
//! training score and signals once when it first improves on its running best
//! by more than the threshold. From then on [`EarlyStopController::check`]
//! is fed the validation score every epoch.
//!
//! `check` starts in the coarse phase, where only improvements larger than the
//! threshold reset the wait counter. Once the counter reaches the coarse
//! patience the controller moves to the fine phase, resets the counter and
//! counts any strict improvement. Stopping is signalled when the counter
//! exceeds the active phase's patience. The best score and epoch always follow
//! the minimum observed validation score.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Active patience phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Short patience, threshold-sized improvements only
    Coarse,
    /// Configured patience, any improvement
    Fine,
}

/// Persisted controller state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EarlyStopState {
    /// Lowest validation score seen by `check`
    pub best_score: Option<f64>,
    /// 1-based epoch of `best_score`; 0 before any check
    pub best_epoch: usize,
    /// Consecutive checks without a counted improvement
    pub wait: usize,
    /// Active phase
    pub phase: Phase,
    /// Running best training score seen by `refresh_status`
    pub best_train_score: Option<f64>,
    /// Whether `refresh_status` has already signalled
    pub eligible: bool,
}

impl Default for EarlyStopState {
    fn default() -> Self {
        Self {
            best_score: None,
            best_epoch: 0,
            wait: 0,
            phase: Phase::Coarse,
            best_train_score: None,
            eligible: false,
        }
    }
}

/// Early-stop state machine over `(best_score, best_epoch, wait, phase)`
#[derive(Debug, Clone)]
pub struct EarlyStopController {
    patiences: [usize; 2],
    threshold: f64,
    state: EarlyStopState,
}

impl EarlyStopController {
    /// Create a controller with `[coarse, fine]` patience and improvement threshold
    pub fn new(patiences: [usize; 2], threshold: f64) -> Self {
        Self {
            patiences,
            threshold,
            state: EarlyStopState::default(),
        }
    }

    /// Rebuild a controller from persisted state
    pub fn with_state(patiences: [usize; 2], threshold: f64, state: EarlyStopState) -> Self {
        Self {
            patiences,
            threshold,
            state,
        }
    }

    /// Feed the training score; `true` exactly once, on the first improvement beyond the threshold
    pub fn refresh_status(&mut self, score: f64) -> bool {
        if self.state.eligible {
            return false;
        }
        match self.state.best_train_score {
            Some(best) if best - score > self.threshold => {
                self.state.best_train_score = Some(score);
                self.state.eligible = true;
                debug!(score, best, "training score improved past threshold");
                true
            }
            Some(best) if score < best => {
                self.state.best_train_score = Some(score);
                false
            }
            Some(_) => false,
            None => {
                self.state.best_train_score = Some(score);
                false
            }
        }
    }

    /// Feed the validation score of 0-based `epoch`; `true` signals a stop
    pub fn check(&mut self, score: f64, epoch: usize) -> bool {
        let state = &mut self.state;
        let counted = match (state.best_score, state.phase) {
            (None, _) => true,
            (Some(best), Phase::Coarse) => best - score > self.threshold,
            (Some(best), Phase::Fine) => score < best,
        };

        if state.best_score.map_or(true, |best| score < best) {
            state.best_score = Some(score);
            state.best_epoch = epoch + 1;
        }

        if counted {
            state.wait = 0;
        } else {
            state.wait += 1;
        }

        if state.phase == Phase::Coarse && state.wait >= self.patiences[0] {
            debug!(epoch = epoch + 1, "coarse patience exhausted, switching to fine phase");
            state.phase = Phase::Fine;
            state.wait = 0;
        }

        state.wait > self.patience()
    }

    /// Patience of the active phase
    pub fn patience(&self) -> usize {
        match self.state.phase {
            Phase::Coarse => self.patiences[0],
            Phase::Fine => self.patiences[1],
        }
    }

    /// 1-based epoch of the best validation score, 0 if none yet
    pub fn get_best_epoch(&self) -> usize {
        self.state.best_epoch
    }

    /// Current wait counter
    pub fn wait(&self) -> usize {
        self.state.wait
    }

    /// Active phase
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Snapshot for persistence
    pub fn state(&self) -> &EarlyStopState {
        &self.state
    }

    /// Forget everything, including the eligibility signal
    pub fn reset(&mut self) {
        self.state = EarlyStopState::default();
    }
}
