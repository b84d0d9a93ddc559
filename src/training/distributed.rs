//! Data-parallel replicated training step
//!
//! A batch is split into one contiguous shard per replica. Every replica runs
//! [`train_step`] on its shard in parallel; collecting the results is the
//! barrier. Losses are already normalised by the global batch size, so the
//! step loss is their sum and the summed gradients equal the gradients of the
//! full batch on a single device. The optimizer is applied once, to the
//! reduced gradients.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use rayon::prelude::*;
use tracing::{info, warn};

use super::data::Batch;
use super::loss::flow_loss;
use super::masks::create_masks;
use super::metrics::{flow_channel, Direction, TrainMetrics};
use super::model::{FlowModel, ModelInputs};
use super::optimizers::Optimizer;
use crate::error::{Error, Result};

/// Compute device and number of logical replicas
#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    device: Device,
    replicas: usize,
}

impl ReplicaTopology {
    /// Explicit topology; at least one replica
    pub fn new(device: Device, replicas: usize) -> Self {
        Self {
            device,
            replicas: replicas.max(1),
        }
    }

    /// First CUDA device when available, otherwise the CPU
    pub fn detect(replicas: usize) -> Self {
        let device = match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("accelerator initialisation failed, falling back to CPU: {}", e);
                Device::Cpu
            }
        };
        info!(?device, replicas, "replica topology");
        Self::new(device, replicas)
    }

    /// Device holding parameters and batches
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of replicas a batch is split across
    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

/// Everything a replica needs to compute its share of a step
#[derive(Debug)]
pub struct StepContext<'a, M> {
    /// Shared model; parameters are read, never written, by replicas
    pub model: &'a M,
    /// Near/far horizon loss weights
    pub loss_weights: Option<(f64, f64)>,
    /// Per-replica batch size times replica count
    pub global_batch_size: usize,
}

impl<M> Clone for StepContext<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for StepContext<'_, M> {}

/// Output of one replica
pub struct ReplicaStep {
    /// Globally normalised loss of the shard
    pub loss: f64,
    /// Local gradients, not yet applied
    pub grads: GradStore,
    /// Ground truth per direction, channel order
    pub real: [Vec<f32>; 2],
    /// Predictions per direction, channel order
    pub pred: [Vec<f32>; 2],
}

/// Forward and backward pass of one replica on its shard
pub fn train_step<M: FlowModel>(ctx: StepContext<'_, M>, shard: &Batch) -> Result<ReplicaStep> {
    let bundle = &shard.inputs;
    let masks = create_masks(&bundle.grid, &bundle.local, &bundle.decoder_flow)?;
    let output = ctx
        .model
        .forward(&ModelInputs::from_bundle(bundle), true, &masks)?;

    let real = &shard.targets.y;
    let pred = &output.predictions;
    if pred.dims() != real.dims() {
        return Err(Error::shape(format!(
            "predictions {:?} do not match targets {:?}",
            pred.dims(),
            real.dims()
        )));
    }

    let loss = flow_loss(real, pred, ctx.loss_weights, ctx.global_batch_size)?;
    let grads = loss.backward()?;
    let loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;

    let pred = pred.detach();
    Ok(ReplicaStep {
        loss,
        grads,
        real: [
            flow_channel(real, Direction::Inflow, None)?,
            flow_channel(real, Direction::Outflow, None)?,
        ],
        pred: [
            flow_channel(&pred, Direction::Inflow, None)?,
            flow_channel(&pred, Direction::Outflow, None)?,
        ],
    })
}

/// Combine per-replica losses; each is already a fraction of the global loss
pub fn reduce_losses(losses: &[f64]) -> f64 {
    losses.iter().sum()
}

/// Sum replica gradients for every parameter, in replica order
pub fn all_reduce_gradients(params: &[Var], stores: Vec<GradStore>) -> Result<GradStore> {
    let mut stores = stores.into_iter();
    let mut reduced = stores
        .next()
        .ok_or_else(|| Error::internal("gradient reduction over zero replicas"))?;
    let rest: Vec<GradStore> = stores.collect();
    if rest.is_empty() {
        return Ok(reduced);
    }

    for param in params {
        let key = param.as_tensor();
        let mut sum = reduced.get(key).cloned();
        for store in &rest {
            if let Some(grad) = store.get(key) {
                sum = Some(match sum {
                    Some(acc) => (acc + grad)?,
                    None => grad.clone(),
                });
            }
        }
        if let Some(sum) = sum {
            reduced.insert(key, sum);
        }
    }
    Ok(reduced)
}

/// Runs replicated steps and applies the reduced gradients
#[derive(Debug, Clone)]
pub struct DistributedExecutor {
    topology: ReplicaTopology,
    params: Vec<Var>,
}

impl DistributedExecutor {
    /// Executor over the given trainable parameters
    pub fn new(topology: ReplicaTopology, params: Vec<Var>) -> Self {
        Self { topology, params }
    }

    /// Replica topology
    pub fn topology(&self) -> &ReplicaTopology {
        &self.topology
    }

    /// One synchronous data-parallel step on `batch`; returns the summed loss
    ///
    /// A non-finite reduced loss is an error and leaves the parameters untouched.
    pub fn distributed_train_step<M: FlowModel>(
        &self,
        ctx: StepContext<'_, M>,
        optimizer: &mut dyn Optimizer,
        batch: &Batch,
        metrics: &mut TrainMetrics,
        step: usize,
    ) -> Result<f64> {
        let shards = batch.shard(self.topology.replicas())?;
        let replicas = shards
            .par_iter()
            .map(|shard| train_step(ctx, shard))
            .collect::<Result<Vec<_>>>()?;

        let losses: Vec<f64> = replicas.iter().map(|r| r.loss).collect();
        let loss = reduce_losses(&losses);
        if !loss.is_finite() {
            return Err(Error::NonFiniteLoss { step, loss });
        }

        let mut stores = Vec::with_capacity(replicas.len());
        for replica in replicas {
            for direction in Direction::ALL {
                let ch = direction.channel();
                metrics.update(direction, &replica.real[ch], &replica.pred[ch]);
            }
            stores.push(replica.grads);
        }

        let grads = all_reduce_gradients(&self.params, stores)?;
        optimizer.step(&grads)?;
        Ok(loss)
    }
}
