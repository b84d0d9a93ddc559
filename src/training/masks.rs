//! Attention masks built from raw flow channels
//!
//! A value of `1.0` marks a masked position.

use candle_core::{DType, Tensor, D};

use crate::error::Result;

/// Flow channels (inflow, outflow) at the front of each feature vector
pub const FLOW_CHANNELS: usize = 2;

/// Masks consumed by [`FlowModel::forward`](super::model::FlowModel::forward)
#[derive(Debug, Clone)]
pub struct AttentionMasks {
    /// Padding mask over the global encoder sequence, `[batch, 1, 1, seq]`
    pub global_padding: Tensor,
    /// Padding mask over the local encoder sequence, `[batch, 1, 1, seq]`
    pub local_padding: Tensor,
    /// Look-ahead mask merged with decoder padding, `[batch, 1, dec, dec]`
    pub combined: Tensor,
}

/// Positions whose feature vector is entirely zero, shaped `[batch, 1, 1, seq]`
pub fn padding_mask(x: &Tensor) -> Result<Tensor> {
    let zero = x
        .flatten_from(2)?
        .abs()?
        .sum(D::Minus1)?
        .eq(0.0)?
        .to_dtype(DType::F32)?;
    Ok(zero.unsqueeze(1)?.unsqueeze(1)?)
}

/// Strict upper-triangular mask hiding future decoder positions
pub fn look_ahead_mask(len: usize, device: &candle_core::Device) -> Result<Tensor> {
    let visible = Tensor::tril2(len, DType::F32, device)?;
    Ok(visible.affine(-1.0, 1.0)?)
}

/// Build all masks from the flow channels of the encoder inputs and the decoder frames
pub fn create_masks(grid: &Tensor, local: &Tensor, decoder_flow: &Tensor) -> Result<AttentionMasks> {
    let global_padding = padding_mask(&grid.narrow(D::Minus1, 0, FLOW_CHANNELS)?)?;
    let local_padding = padding_mask(&local.narrow(D::Minus1, 0, FLOW_CHANNELS)?)?;

    let dec_len = decoder_flow.dim(1)?;
    let look_ahead = look_ahead_mask(dec_len, decoder_flow.device())?;
    let dec_padding = padding_mask(decoder_flow)?;
    let combined = dec_padding.broadcast_maximum(&look_ahead)?;

    Ok(AttentionMasks {
        global_padding,
        local_padding,
        combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_look_ahead_mask() {
        let mask = look_ahead_mask(3, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![0.0, 1.0, 1.0],
                vec![0.0, 0.0, 1.0],
                vec![0.0, 0.0, 0.0],
            ]
        );
    }

    #[test]
    fn test_padding_mask_marks_zero_frames() {
        // [batch=1, seq=3, channels=2]; the middle frame is padding
        let x = Tensor::new(&[[[1f32, 0.], [0., 0.], [0., 2.]]], &Device::Cpu).unwrap();
        let mask = padding_mask(&x).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 1, 3]);
        let flat: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_combined_mask_shape() {
        let dev = Device::Cpu;
        let grid = Tensor::ones((2, 4, 3), DType::F32, &dev).unwrap();
        let local = Tensor::ones((2, 4, 3), DType::F32, &dev).unwrap();
        let dec = Tensor::ones((2, 2, 2), DType::F32, &dev).unwrap();
        let masks = create_masks(&grid, &local, &dec).unwrap();
        assert_eq!(masks.combined.dims(), &[2, 1, 2, 2]);
        assert_eq!(masks.global_padding.dims(), &[2, 1, 1, 4]);
    }
}
