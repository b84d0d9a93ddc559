//! Learning rate schedules
//!
//! A schedule is a pure function of the 1-based optimizer step, so resuming
//! from a checkpoint only needs the persisted step counter.

/// Scalar learning rate as a function of step
pub trait LearningRateSchedule: Send + Sync {
    /// Schedule name
    fn name(&self) -> &str;

    /// Learning rate for the 1-based `step`
    fn rate(&self, step: usize) -> f64;
}

/// Transformer warm-up schedule: `d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformerSchedule {
    d_model: f64,
    warmup_steps: f64,
}

impl TransformerSchedule {
    /// Create a schedule for a model of width `d_model`
    pub fn new(d_model: usize, warmup_steps: usize) -> Self {
        Self {
            d_model: d_model.max(1) as f64,
            warmup_steps: warmup_steps.max(1) as f64,
        }
    }
}

impl LearningRateSchedule for TransformerSchedule {
    fn name(&self) -> &str {
        "transformer"
    }

    fn rate(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let decay = step.powf(-0.5);
        let warmup = step * self.warmup_steps.powf(-1.5);
        self.d_model.powf(-0.5) * decay.min(warmup)
    }
}

/// Fixed learning rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantSchedule(pub f64);

impl LearningRateSchedule for ConstantSchedule {
    fn name(&self) -> &str {
        "constant"
    }

    fn rate(&self, _step: usize) -> f64 {
        self.0
    }
}
