//! Adam optimizer over every variable of a [`VarMap`]
//!
//! Moment estimates are kept per variable name so they can be saved to and
//! restored from safetensors alongside the weights.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::{LearningRateSchedule, Optimizer};
use crate::error::{Error, Result};

const FIRST_MOMENT_SUFFIX: &str = ".adam_m";
const SECOND_MOMENT_SUFFIX: &str = ".adam_v";

/// Adam hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    /// Decay of the first moment
    pub beta1: f64,
    /// Decay of the second moment
    pub beta2: f64,
    /// Denominator epsilon
    pub epsilon: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.98,
            epsilon: 1e-9,
        }
    }
}

struct Slot {
    name: String,
    param: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam with a step-indexed learning rate schedule
pub struct Adam {
    slots: Vec<Slot>,
    params: AdamParams,
    schedule: Box<dyn LearningRateSchedule>,
    step_count: usize,
    learning_rate: f64,
}

impl Adam {
    /// Optimize every variable currently registered in `var_map`
    pub fn new(
        var_map: &VarMap,
        params: AdamParams,
        schedule: Box<dyn LearningRateSchedule>,
    ) -> Result<Self> {
        let mut named: Vec<(String, Var)> = {
            let data = var_map
                .data()
                .lock()
                .map_err(|_| Error::internal("variable map lock poisoned"))?;
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect()
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let slots = named
            .into_iter()
            .map(|(name, param)| {
                let first_moment = Var::zeros(param.shape(), param.dtype(), param.device())?;
                let second_moment = Var::zeros(param.shape(), param.dtype(), param.device())?;
                Ok(Slot {
                    name,
                    param,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let learning_rate = schedule.rate(1);
        Ok(Self {
            slots,
            params,
            schedule,
            step_count: 0,
            learning_rate,
        })
    }

    /// Number of optimized variables
    pub fn parameter_count(&self) -> usize {
        self.slots.len()
    }

    /// Name of the learning rate schedule
    pub fn schedule_name(&self) -> &str {
        self.schedule.name()
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as i32;
        let AdamParams {
            beta1,
            beta2,
            epsilon,
        } = self.params;
        let lr = self.schedule.rate(self.step_count);
        self.learning_rate = lr;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        for slot in &self.slots {
            let Some(grad) = gradients.get(slot.param.as_tensor()) else {
                continue;
            };
            let m = ((slot.first_moment.as_tensor() * beta1)? + (grad * (1.0 - beta1))?)?;
            let v = ((slot.second_moment.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m / bias_correction1)?;
            let v_hat = (&v / bias_correction2)?;
            let update = (m_hat / (v_hat.sqrt()? + epsilon)?)?;
            let next = (slot.param.as_tensor() - (update * lr)?)?;

            slot.param.set(&next)?;
            slot.first_moment.set(&m)?;
            slot.second_moment.set(&v)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::with_capacity(self.slots.len() * 2);
        for slot in &self.slots {
            state.insert(
                format!("{}{FIRST_MOMENT_SUFFIX}", slot.name),
                slot.first_moment.as_tensor().clone(),
            );
            state.insert(
                format!("{}{SECOND_MOMENT_SUFFIX}", slot.name),
                slot.second_moment.as_tensor().clone(),
            );
        }
        state
    }

    fn load_state_tensors(&mut self, tensors: HashMap<String, Tensor>, step_count: usize) -> Result<()> {
        for slot in &self.slots {
            for (suffix, moment) in [
                (FIRST_MOMENT_SUFFIX, &slot.first_moment),
                (SECOND_MOMENT_SUFFIX, &slot.second_moment),
            ] {
                let key = format!("{}{suffix}", slot.name);
                let saved = tensors
                    .get(&key)
                    .ok_or_else(|| Error::checkpoint(format!("optimizer state is missing '{key}'")))?;
                moment.set(&saved.to_device(moment.device())?)?;
            }
        }
        self.step_count = step_count;
        self.learning_rate = self.schedule.rate(step_count.max(1));
        Ok(())
    }
}
