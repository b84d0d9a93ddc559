//! Optimizers and learning rate schedules
//!
//! Optimizers apply one reduced [`GradStore`] per global step. Their moment
//! tensors are exposed by name so the checkpoint store can persist them next
//! to the model weights.

pub mod adam;
pub mod schedulers;

pub use adam::{Adam, AdamParams};
pub use schedulers::{ConstantSchedule, LearningRateSchedule, TransformerSchedule};

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::Tensor;

use crate::error::Result;

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from reduced gradients
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Learning rate used by the most recent step
    fn learning_rate(&self) -> f64;

    /// Updates applied so far
    fn step_count(&self) -> usize;

    /// Named state tensors for checkpointing
    fn state_tensors(&self) -> HashMap<String, Tensor>;

    /// Restore state saved by [`Optimizer::state_tensors`]
    fn load_state_tensors(&mut self, tensors: HashMap<String, Tensor>, step_count: usize) -> Result<()>;
}
