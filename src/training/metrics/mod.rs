//! Evaluation metrics, trivial-cell masking and textual reports
//!
//! Accumulators are plain values owned by whoever runs a pass; they are reset
//! explicitly at the start of every evaluation or training epoch.

pub mod accumulators;
pub mod exporters;

pub use accumulators::{Mae, Mape, MetricAccumulator, Rmse};
pub use exporters::{JsonlTelemetry, NullTelemetry, ResultLog, ScalarRecord, TelemetrySink};

use std::fmt::Write as _;

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Flow direction, also the channel index in flow tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Channel 0
    Inflow = 0,
    /// Channel 1
    Outflow = 1,
}

impl Direction {
    /// Both directions in channel order
    pub const ALL: [Direction; 2] = [Direction::Inflow, Direction::Outflow];

    /// Channel index in flow tensors
    pub fn channel(self) -> usize {
        self as usize
    }
}

/// Host copy of one direction of a `[batch, horizons, 2]` flow tensor
///
/// With `horizon = Some(h)` only that horizon is taken, otherwise all of them.
pub fn flow_channel(flows: &Tensor, direction: Direction, horizon: Option<usize>) -> Result<Vec<f32>> {
    let flows = match horizon {
        Some(h) => flows.narrow(1, h, 1)?,
        None => flows.clone(),
    };
    Ok(flows
        .narrow(2, direction.channel(), 1)?
        .flatten_all()?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?)
}

/// Keep the pairs whose ground truth exceeds `threshold`
pub fn mask_trivial(real: &[f32], pred: &[f32], threshold: f64) -> (Vec<f32>, Vec<f32>) {
    let threshold = threshold as f32;
    real.iter()
        .zip(pred)
        .filter(|&(&r, _)| r > threshold)
        .map(|(&r, &p)| (r, p))
        .unzip()
}

/// Masked ground truth and predictions of one direction at one horizon
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskedPairs {
    /// Ground truth above the trivial threshold
    pub real: Vec<f32>,
    /// Predictions at the same cells
    pub pred: Vec<f32>,
}

impl MaskedPairs {
    /// Filter raw values of one direction
    pub fn from_raw(real: &[f32], pred: &[f32], threshold: f64) -> Self {
        let (real, pred) = mask_trivial(real, pred, threshold);
        Self { real, pred }
    }
}

/// Accumulators of one direction at one horizon
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    /// Always updated
    pub rmse: Rmse,
    /// Updated during the final test pass only
    pub mae: Mae,
    /// Updated during the final test pass only
    pub mape: Mape,
}

impl FlowMetrics {
    fn update(&mut self, pairs: &MaskedPairs, final_test: bool) {
        self.rmse.update(&pairs.real, &pairs.pred);
        if final_test {
            self.mae.update(&pairs.real, &pairs.pred);
            self.mape.update(&pairs.real, &pairs.pred);
        }
    }

    fn reset(&mut self) {
        self.rmse.reset();
        self.mae.reset();
        self.mape.reset();
    }
}

/// Per-horizon, per-direction evaluation accumulators
#[derive(Debug, Clone)]
pub struct HorizonMetrics {
    horizons: Vec<[FlowMetrics; 2]>,
}

impl HorizonMetrics {
    /// Fresh accumulators for `n_pred` horizons
    pub fn new(n_pred: usize) -> Self {
        Self {
            horizons: vec![Default::default(); n_pred],
        }
    }

    /// Number of horizons
    pub fn n_pred(&self) -> usize {
        self.horizons.len()
    }

    /// Reset every accumulator
    pub fn reset(&mut self) {
        for pair in &mut self.horizons {
            for metrics in pair {
                metrics.reset();
            }
        }
    }

    /// Fold the masked pairs of one direction at one horizon
    pub fn update(&mut self, horizon: usize, direction: Direction, pairs: &MaskedPairs, final_test: bool) {
        self.horizons[horizon][direction.channel()].update(pairs, final_test);
    }

    /// Accumulators of one direction at one horizon
    pub fn get(&self, horizon: usize, direction: Direction) -> &FlowMetrics {
        &self.horizons[horizon][direction.channel()]
    }

    /// RMSE of one direction at one horizon
    pub fn rmse(&self, horizon: usize, direction: Direction) -> f64 {
        self.get(horizon, direction).rmse.result()
    }

    /// Inflow plus outflow RMSE of the first horizon
    pub fn validation_score(&self) -> f64 {
        self.rmse(0, Direction::Inflow) + self.rmse(0, Direction::Outflow)
    }

    /// Normalised RMSE per horizon, as in `Epoch 3 RMSE(in/out): 1. a/b 2. c/d`
    pub fn format_epoch(&self, epoch: usize) -> String {
        let mut template = format!("Epoch {} {}(in/out):", epoch + 1, Rmse::default().name());
        for i in 0..self.n_pred() {
            let _ = write!(
                template,
                " {}. {:.6}/{:.6}",
                i + 1,
                self.rmse(i, Direction::Inflow),
                self.rmse(i, Direction::Outflow)
            );
        }
        template.push('\n');
        template
    }

    /// Final report with denormalised and normalised RMSE/MAE, and MAPE
    pub fn format_final(&self, flow_max: f64) -> String {
        let labels = FlowMetrics::default();
        let mut rmse = format!("{}(in/out):", labels.rmse.name());
        let mut mae = format!("{}(in/out):", labels.mae.name());
        let mut mape = format!("{}(in/out):", labels.mape.name());
        for i in 0..self.n_pred() {
            let inflow = self.get(i, Direction::Inflow);
            let outflow = self.get(i, Direction::Outflow);
            let (rin, rout) = (inflow.rmse.result(), outflow.rmse.result());
            let _ = write!(
                rmse,
                " {}. {:.2}({:.6})/{:.2}({:.6})",
                i + 1,
                rin * flow_max,
                rin,
                rout * flow_max,
                rout
            );
            let (ain, aout) = (inflow.mae.result(), outflow.mae.result());
            let _ = write!(
                mae,
                " {}. {:.2}({:.6})/{:.2}({:.6})",
                i + 1,
                ain * flow_max,
                ain,
                aout * flow_max,
                aout
            );
            let _ = write!(
                mape,
                " {}. {:.2}/{:.2}",
                i + 1,
                inflow.mape.result(),
                outflow.mape.result()
            );
        }
        format!("Final:\n{rmse}\n{mae}\n{mape}")
    }
}

/// Train-time RMSE over all horizons, per direction
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainMetrics {
    /// Channel 0
    pub inflow: Rmse,
    /// Channel 1
    pub outflow: Rmse,
}

impl TrainMetrics {
    /// Reset both accumulators
    pub fn reset(&mut self) {
        self.inflow.reset();
        self.outflow.reset();
    }

    /// Fold raw (unmasked) values of one direction
    pub fn update(&mut self, direction: Direction, real: &[f32], pred: &[f32]) {
        match direction {
            Direction::Inflow => self.inflow.update(real, pred),
            Direction::Outflow => self.outflow.update(real, pred),
        }
    }

    /// Mean of inflow and outflow RMSE, the score fed to the eligibility check
    pub fn mean_rmse(&self) -> f64 {
        (self.inflow.result() + self.outflow.result()) / 2.0
    }
}
