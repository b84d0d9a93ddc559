//! Synthetic batches with a learnable relation between decoder frames and targets

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::training::data::{Batch, InputBundle, TargetBundle};

/// Tensor sizes of a mock batch
#[derive(Debug, Clone, Copy)]
pub struct MockShape {
    pub batch: usize,
    pub n_pred: usize,
    pub seq_len: usize,
    pub features: usize,
    pub ex_dim: usize,
}

impl Default for MockShape {
    fn default() -> Self {
        Self {
            batch: 4,
            n_pred: 3,
            seq_len: 5,
            features: 4,
            ex_dim: 3,
        }
    }
}

fn uniform(rng: &mut StdRng, dims: &[usize], low: f32, high: f32, device: &Device) -> Result<Tensor> {
    let len: usize = dims.iter().product();
    let data: Vec<f32> = (0..len).map(|_| low + (high - low) * rng.random::<f32>()).collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

/// One batch; targets are `0.8 * decoder_flow + 0.1`
pub fn create_mock_batch(rng: &mut StdRng, shape: MockShape, device: &Device) -> Result<Batch> {
    let MockShape {
        batch,
        n_pred,
        seq_len,
        features,
        ex_dim,
    } = shape;

    let decoder_flow = uniform(rng, &[batch, n_pred, 2], 0.0, 1.0, device)?;
    let y = decoder_flow.affine(0.8, 0.1)?;

    Ok(Batch {
        inputs: InputBundle {
            grid: uniform(rng, &[batch, seq_len, features], 0.0, 1.0, device)?,
            local: uniform(rng, &[batch, seq_len, features], 0.0, 1.0, device)?,
            external: uniform(rng, &[batch, seq_len, ex_dim], 0.0, 1.0, device)?,
            decoder_flow,
            decoder_external: uniform(rng, &[batch, n_pred, ex_dim], 0.0, 1.0, device)?,
            local_coords: uniform(rng, &[batch, 2], 0.0, 1.0, device)?,
            global_coords: uniform(rng, &[batch, 2], 0.0, 1.0, device)?,
        },
        targets: TargetBundle { y },
    })
}

/// `count` batches from a seeded generator
pub fn create_mock_batches(seed: u64, count: usize, shape: MockShape, device: &Device) -> Result<Vec<Batch>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| create_mock_batch(&mut rng, shape, device))
        .collect()
}
