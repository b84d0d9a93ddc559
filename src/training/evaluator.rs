//! Autoregressive multi-horizon evaluation
//!
//! Decoding starts from the current frame only. Each horizon runs the model in
//! inference mode on the frames decoded so far, keeps the newest prediction
//! and appends it to the decoder input of the next horizon, so horizons are
//! strictly sequential. Batches may still be split across replicas.

use candle_core::Tensor;
use rayon::prelude::*;
use tracing::debug;

use super::data::{BatchSource, InputBundle};
use super::masks::create_masks;
use super::metrics::{flow_channel, Direction, HorizonMetrics, MaskedPairs};
use super::model::{FlowModel, ModelInputs};
use crate::error::{Error, Result};

/// Runs autoregressive decoding and folds masked per-horizon metrics
#[derive(Debug, Clone)]
pub struct MultiHorizonEvaluator {
    n_pred: usize,
    threshold: f64,
    replicas: usize,
}

impl MultiHorizonEvaluator {
    /// `threshold` is in normalised units; cells at or below it are ignored
    pub fn new(n_pred: usize, threshold: f64, replicas: usize) -> Self {
        Self {
            n_pred,
            threshold,
            replicas: replicas.max(1),
        }
    }

    /// Number of decoded horizons
    pub fn n_pred(&self) -> usize {
        self.n_pred
    }

    /// Trivial-cell threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decode `n_pred` frames, returning `[batch, n_pred, 2]`
    pub fn decode<M: FlowModel>(&self, model: &M, inputs: &InputBundle) -> Result<Tensor> {
        let available = inputs.decoder_external.dim(1)?;
        if available < self.n_pred {
            return Err(Error::shape(format!(
                "decoder_external covers {available} horizons, {} required",
                self.n_pred
            )));
        }

        let encoder = ModelInputs::from_bundle(inputs);
        let mut targets = inputs.decoder_flow.narrow(1, 0, 1)?;
        let mut decoded = Vec::with_capacity(self.n_pred);

        for i in 0..self.n_pred {
            let external = inputs.decoder_external.narrow(1, 0, i + 1)?;
            let masks = create_masks(&inputs.grid, &inputs.local, &targets)?;
            let output = model.forward(&encoder.with_decoder(&targets, &external), false, &masks)?;

            let positions = output.predictions.dim(1)?;
            if positions == 0 {
                return Err(Error::shape("model returned an empty prediction sequence"));
            }
            let newest = output.predictions.narrow(1, positions - 1, 1)?;
            targets = Tensor::cat(&[&targets, &newest], 1)?;
            decoded.push(newest);
        }

        Ok(Tensor::cat(&decoded, 1)?)
    }

    /// Evaluate every batch of `source` into `metrics`, which is reset first
    ///
    /// MAE and MAPE are only accumulated when `final_test` is set.
    pub fn evaluate<M: FlowModel>(
        &self,
        model: &M,
        source: &dyn BatchSource,
        metrics: &mut HorizonMetrics,
        final_test: bool,
    ) -> Result<()> {
        metrics.reset();
        let mut batches = 0usize;

        for batch in source.batches() {
            let batch = batch?;
            batch.validate(self.n_pred)?;
            let shards = batch.shard(self.replicas)?;
            let decoded = shards
                .par_iter()
                .map(|shard| -> Result<(Tensor, Tensor)> {
                    Ok((shard.targets.y.clone(), self.decode(model, &shard.inputs)?))
                })
                .collect::<Result<Vec<_>>>()?;

            for (real, pred) in &decoded {
                self.fold(real, pred, metrics, final_test)?;
            }
            batches += 1;
        }

        debug!(batches, final_test, "evaluation pass finished");
        Ok(())
    }

    fn fold(&self, real: &Tensor, pred: &Tensor, metrics: &mut HorizonMetrics, final_test: bool) -> Result<()> {
        for horizon in 0..self.n_pred {
            for direction in Direction::ALL {
                let pairs = MaskedPairs::from_raw(
                    &flow_channel(real, direction, Some(horizon))?,
                    &flow_channel(pred, direction, Some(horizon))?,
                    self.threshold,
                );
                metrics.update(horizon, direction, &pairs, final_test);
            }
        }
        Ok(())
    }
}
