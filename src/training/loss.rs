//! Globally normalised mean-squared-error loss
//!
//! Every replica divides its summed loss by the *global* batch size, so the
//! per-replica losses and gradients add up to the single-device values on the
//! full batch.

use candle_core::{Tensor, D};

use crate::error::Result;

/// Per-sample MSE over the channel axis, summed and divided by `global_batch_size`
pub fn compute_average_loss(real: &Tensor, pred: &Tensor, global_batch_size: usize) -> Result<Tensor> {
    let per_position = (pred - real)?.sqr()?.mean(D::Minus1)?;
    Ok((per_position.sum_all()? / global_batch_size as f64)?)
}

/// Training loss, optionally splitting the first horizon from the rest
///
/// `real` and `pred` are `[batch, horizons, 2]`. With `weights = Some((w1, w2))`
/// the first horizon is weighted by `w1` and the remaining ones by `w2`.
pub fn flow_loss(
    real: &Tensor,
    pred: &Tensor,
    weights: Option<(f64, f64)>,
    global_batch_size: usize,
) -> Result<Tensor> {
    let Some((near_weight, far_weight)) = weights else {
        return compute_average_loss(real, pred, global_batch_size);
    };

    let near = compute_average_loss(&real.narrow(1, 0, 1)?, &pred.narrow(1, 0, 1)?, global_batch_size)?;
    let horizons = real.dim(1)?;
    if horizons < 2 {
        return Ok((near * near_weight)?);
    }
    let far = compute_average_loss(
        &real.narrow(1, 1, horizons - 1)?,
        &pred.narrow(1, 1, horizons - 1)?,
        global_batch_size,
    )?;
    Ok(((near * near_weight)? + (far * far_weight)?)?)
}
