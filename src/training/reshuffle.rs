//! Periodic regeneration of the training split
//!
//! Reshuffle epochs depend only on the epoch index and configuration: the
//! k-th period is `base_period * tiers[k]` (rounded, at least one epoch), the
//! last tier repeating once the list is exhausted. With a base period of 5
//! and tiers `[2.0]` the split is rebuilt after epochs 10, 20, 30 and so on.

use serde::{Deserialize, Serialize};

/// Persisted bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReshuffleState {
    /// Reshuffles signalled so far
    pub reshuffles: usize,
    /// 0-based epoch of the most recent reshuffle
    pub last_epoch: Option<usize>,
}

/// Signals when the training split should be rebuilt
#[derive(Debug, Clone)]
pub struct ReshuffleController {
    base_period: usize,
    tiers: Vec<f64>,
    state: ReshuffleState,
}

impl ReshuffleController {
    /// Create a controller; an empty tier list behaves like `[1.0]`
    pub fn new(base_period: usize, tiers: &[f64]) -> Self {
        let tiers = if tiers.is_empty() { vec![1.0] } else { tiers.to_vec() };
        Self {
            base_period,
            tiers,
            state: ReshuffleState::default(),
        }
    }

    /// Rebuild a controller from persisted state
    pub fn with_state(base_period: usize, tiers: &[f64], state: ReshuffleState) -> Self {
        Self {
            state,
            ..Self::new(base_period, tiers)
        }
    }

    /// Length in epochs of the `k`-th reshuffle period
    pub fn period(&self, k: usize) -> usize {
        let tier = self.tiers[k.min(self.tiers.len() - 1)];
        ((self.base_period as f64 * tier).round() as usize).max(1)
    }

    /// Whether the split should be rebuilt after 0-based `epoch`
    pub fn is_reshuffle_epoch(&self, epoch: usize) -> bool {
        let completed = epoch + 1;
        let mut boundary = 0;
        let mut k = 0;
        while boundary < completed {
            boundary += self.period(k);
            k += 1;
        }
        boundary == completed
    }

    /// Check after 0-based `epoch`, recording the reshuffle when signalled
    pub fn check(&mut self, epoch: usize) -> bool {
        let reshuffle = self.is_reshuffle_epoch(epoch);
        if reshuffle {
            self.state.reshuffles += 1;
            self.state.last_epoch = Some(epoch);
        }
        reshuffle
    }

    /// Snapshot for persistence
    pub fn state(&self) -> &ReshuffleState {
        &self.state
    }
}
