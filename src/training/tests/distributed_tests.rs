//! Replicated steps against single-device training

use anyhow::Result;
use approx::assert_relative_eq;
use candle_core::Device;
use candle_nn::VarMap;

use crate::error::Error;
use crate::training::distributed::{all_reduce_gradients, train_step, DistributedExecutor, ReplicaTopology, StepContext};
use crate::training::metrics::{MetricAccumulator, TrainMetrics};
use crate::training::optimizers::{Adam, AdamParams, ConstantSchedule, Optimizer};

use super::fixtures::LinearFlowModel;
use super::mock_data::{create_mock_batches, MockShape};

fn grads_of(var_map: &VarMap, grads: &candle_core::backprop::GradStore) -> Result<Vec<Vec<f32>>> {
    var_map
        .all_vars()
        .iter()
        .map(|var| Ok(grads.get(var.as_tensor()).expect("gradient").to_vec1::<f32>()?))
        .collect()
}

#[test]
fn test_sharded_gradients_match_full_batch() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::new(&var_map, &device)?;
    let batch = create_mock_batches(11, 1, MockShape::default(), &device)?.remove(0);

    for weights in [None, Some((0.7, 0.3))] {
        let ctx = StepContext {
            model: &model,
            loss_weights: weights,
            global_batch_size: 4,
        };
        let full = train_step(ctx, &batch)?;

        let replicas = batch
            .shard(2)?
            .iter()
            .map(|shard| train_step(ctx, shard))
            .collect::<crate::error::Result<Vec<_>>>()?;
        let loss: f64 = replicas.iter().map(|r| r.loss).sum();
        assert_relative_eq!(loss, full.loss, epsilon = 1e-6);

        let reduced = all_reduce_gradients(
            &var_map.all_vars(),
            replicas.into_iter().map(|r| r.grads).collect(),
        )?;
        let expected = grads_of(&var_map, &full.grads)?;
        let actual = grads_of(&var_map, &reduced)?;
        for (e, a) in expected.iter().flatten().zip(actual.iter().flatten()) {
            assert_relative_eq!(*e, *a, epsilon = 1e-5);
        }
    }
    Ok(())
}

#[test]
fn test_distributed_step_updates_parameters_and_metrics() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::new(&var_map, &device)?;
    let mut optimizer = Adam::new(&var_map, AdamParams::default(), Box::new(ConstantSchedule(0.05)))?;
    let executor = DistributedExecutor::new(ReplicaTopology::new(device.clone(), 2), var_map.all_vars());
    let shape = MockShape::default();
    let batch = create_mock_batches(5, 1, shape, &device)?.remove(0);

    let before = model.weight();
    let mut metrics = TrainMetrics::default();
    let ctx = StepContext {
        model: &model,
        loss_weights: None,
        global_batch_size: shape.batch,
    };
    let loss = executor.distributed_train_step(ctx, &mut optimizer, &batch, &mut metrics, 1)?;

    assert!(loss.is_finite() && loss > 0.0);
    assert_eq!(optimizer.step_count(), 1);
    assert_ne!(model.weight(), before);
    assert_eq!(metrics.inflow.count(), shape.batch * shape.n_pred);
    assert_eq!(metrics.outflow.count(), shape.batch * shape.n_pred);
    Ok(())
}

#[test]
fn test_non_finite_loss_propagates() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::with_init(&var_map, &device, f64::NAN, 0.0)?;
    let mut optimizer = Adam::new(&var_map, AdamParams::default(), Box::new(ConstantSchedule(0.05)))?;
    let executor = DistributedExecutor::new(ReplicaTopology::new(device.clone(), 2), var_map.all_vars());
    let batch = create_mock_batches(5, 1, MockShape::default(), &device)?.remove(0);

    let ctx = StepContext {
        model: &model,
        loss_weights: None,
        global_batch_size: 4,
    };
    let result = executor.distributed_train_step(ctx, &mut optimizer, &batch, &mut TrainMetrics::default(), 7);
    assert!(matches!(result, Err(Error::NonFiniteLoss { step: 7, .. })));
    assert_eq!(optimizer.step_count(), 0);
    Ok(())
}
