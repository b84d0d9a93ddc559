//! Batch and dataset-provider contracts
//!
//! Dataset construction is owned by an external [`DatasetProvider`]; the
//! trainer only consumes the batches it yields, in order, once per epoch.

use candle_core::Tensor;

use crate::config::Split;
use crate::error::{Error, Result};

/// Encoder and decoder inputs of one batch
#[derive(Debug, Clone)]
pub struct InputBundle {
    /// Global grid features, flow channels first
    pub grid: Tensor,
    /// Local block features, flow channels first
    pub local: Tensor,
    /// External (time/weather) features
    pub external: Tensor,
    /// Decoder flow inputs `[batch, n_pred, 2]`; position 0 is the current frame
    pub decoder_flow: Tensor,
    /// Decoder external features `[batch, n_pred, ex_dim]`
    pub decoder_external: Tensor,
    /// Local block coordinates
    pub local_coords: Tensor,
    /// Global grid coordinates
    pub global_coords: Tensor,
}

/// Ground truth of one batch
#[derive(Debug, Clone)]
pub struct TargetBundle {
    /// Inflow/outflow per horizon, `[batch, n_pred, 2]`
    pub y: Tensor,
}

/// One batch as yielded by a provider
#[derive(Debug, Clone)]
pub struct Batch {
    /// Model inputs
    pub inputs: InputBundle,
    /// Ground truth
    pub targets: TargetBundle,
}

impl Batch {
    /// Number of samples along the batch dimension
    pub fn len(&self) -> Result<usize> {
        Ok(self.targets.y.dim(0)?)
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Check the target layout against the configured horizon count
    pub fn validate(&self, n_pred: usize) -> Result<()> {
        let (batch, horizons, channels) = self.targets.y.dims3()?;
        if horizons != n_pred || channels != 2 {
            return Err(Error::shape(format!(
                "targets must be [batch, {n_pred}, 2], got [{batch}, {horizons}, {channels}]"
            )));
        }
        let decoder = self.inputs.decoder_flow.dims();
        if decoder.len() != 3 || decoder[0] != batch || decoder[1] < 1 {
            return Err(Error::shape(format!(
                "decoder_flow must be [{batch}, n, 2], got {decoder:?}"
            )));
        }
        Ok(())
    }

    /// Split into at most `replicas` contiguous shards along the batch dimension
    pub fn shard(&self, replicas: usize) -> Result<Vec<Batch>> {
        let len = self.len()?;
        if replicas <= 1 || len <= 1 {
            return Ok(vec![self.clone()]);
        }
        let per_shard = len.div_ceil(replicas);
        let mut shards = Vec::with_capacity(replicas);
        let mut start = 0;
        while start < len {
            let size = per_shard.min(len - start);
            shards.push(self.narrow(start, size)?);
            start += size;
        }
        Ok(shards)
    }

    fn narrow(&self, start: usize, size: usize) -> Result<Batch> {
        let take = |t: &Tensor| t.narrow(0, start, size);
        let i = &self.inputs;
        Ok(Batch {
            inputs: InputBundle {
                grid: take(&i.grid)?,
                local: take(&i.local)?,
                external: take(&i.external)?,
                decoder_flow: take(&i.decoder_flow)?,
                decoder_external: take(&i.decoder_external)?,
                local_coords: take(&i.local_coords)?,
                global_coords: take(&i.global_coords)?,
            },
            targets: TargetBundle {
                y: take(&self.targets.y)?,
            },
        })
    }
}

/// An ordered, re-iterable sequence of batches
pub trait BatchSource: Send {
    /// Iterate the batches from the start
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

impl BatchSource for Vec<Batch> {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}

/// Flags forwarded to the provider on every build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    /// Reuse previously generated files
    pub reuse_saved: bool,
    /// Replica count, so the provider batches by the global batch size
    pub replicas: usize,
    /// Reverse spatio-temporal order
    pub revert: bool,
    /// Do not persist generated files
    pub no_save: bool,
}

/// Result of a provider build
pub struct SplitData {
    /// Batches of the requested split
    pub batches: Box<dyn BatchSource>,
    /// Validation batches; present for [`Split::Train`]
    pub validation: Option<Box<dyn BatchSource>>,
}

/// Factory for dataset splits
pub trait DatasetProvider {
    /// Build (or rebuild, reshuffling) the given split
    fn build(&mut self, split: Split, options: &BuildOptions) -> Result<SplitData>;
}
