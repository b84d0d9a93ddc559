//! Contract for the STSAN-XL network
//!
//! The trainer treats the network as an opaque differentiable function whose
//! parameters live in a [`candle_nn::VarMap`] owned by the caller.

use candle_core::Tensor;

use super::data::InputBundle;
use super::masks::AttentionMasks;

/// Borrowed forward-pass inputs
///
/// The decoder tensors are separate from the rest of the bundle because
/// autoregressive evaluation substitutes the frames decoded so far.
#[derive(Debug, Clone, Copy)]
pub struct ModelInputs<'a> {
    /// Global grid features
    pub grid: &'a Tensor,
    /// Local block features
    pub local: &'a Tensor,
    /// External features
    pub external: &'a Tensor,
    /// Decoder flow frames
    pub decoder_flow: &'a Tensor,
    /// Decoder external features, aligned with `decoder_flow`
    pub decoder_external: &'a Tensor,
    /// Local block coordinates
    pub local_coords: &'a Tensor,
    /// Global grid coordinates
    pub global_coords: &'a Tensor,
}

impl<'a> ModelInputs<'a> {
    /// Ground-truth decoder inputs taken straight from a bundle
    pub fn from_bundle(bundle: &'a InputBundle) -> Self {
        Self {
            grid: &bundle.grid,
            local: &bundle.local,
            external: &bundle.external,
            decoder_flow: &bundle.decoder_flow,
            decoder_external: &bundle.decoder_external,
            local_coords: &bundle.local_coords,
            global_coords: &bundle.global_coords,
        }
    }

    /// Same encoder inputs with substituted decoder frames
    pub fn with_decoder(self, decoder_flow: &'a Tensor, decoder_external: &'a Tensor) -> Self {
        Self {
            decoder_flow,
            decoder_external,
            ..self
        }
    }
}

/// Forward-pass outputs
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Predicted flows `[batch, decoder_len, 2]`
    pub predictions: Tensor,
    /// Attention weights of the global branch
    pub attention_global: Tensor,
    /// Attention weights of the local branch
    pub attention_local: Tensor,
}

/// Spatio-temporal flow model
pub trait FlowModel: Send + Sync {
    /// Run the network. `training` enables dropout and similar train-only behaviour.
    fn forward(
        &self,
        inputs: &ModelInputs<'_>,
        training: bool,
        masks: &AttentionMasks,
    ) -> candle_core::Result<ModelOutput>;
}
