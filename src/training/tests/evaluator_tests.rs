//! Autoregressive decoding and masked metric accumulation

use anyhow::Result;
use approx::assert_relative_eq;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use crate::error::Error;
use crate::training::data::Batch;
use crate::training::evaluator::MultiHorizonEvaluator;
use crate::training::masks::AttentionMasks;
use crate::training::metrics::{Direction, HorizonMetrics, MetricAccumulator};
use crate::training::model::{FlowModel, ModelInputs, ModelOutput};

use super::fixtures::LinearFlowModel;
use super::mock_data::{create_mock_batches, MockShape};

#[test]
fn test_decode_feeds_back_predictions() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::new(&var_map, &device)?;
    let shape = MockShape {
        batch: 2,
        ..MockShape::default()
    };
    let batch = create_mock_batches(3, 1, shape, &device)?.remove(0);

    let evaluator = MultiHorizonEvaluator::new(3, 0.1, 1);
    let decoded = evaluator.decode(&model, &batch.inputs)?;
    assert_eq!(decoded.dims(), &[2, 3, 2]);

    // every horizon only sees the frames decoded before it
    assert_eq!(model.decoder_lengths(), vec![1, 2, 3]);

    // weight 0.5, bias 0: horizon h is 0.5^(h+1) times the seed frame
    let seed: Vec<f32> = batch.inputs.decoder_flow.narrow(1, 0, 1)?.flatten_all()?.to_vec1()?;
    for h in 0..3 {
        let frame: Vec<f32> = decoded.narrow(1, h, 1)?.flatten_all()?.to_vec1()?;
        let scale = 0.5f32.powi(h as i32 + 1);
        for (value, s) in frame.iter().zip(&seed) {
            assert_relative_eq!(*value, s * scale, epsilon = 1e-6);
        }
    }
    Ok(())
}

#[test]
fn test_decode_requires_external_features_per_horizon() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::new(&var_map, &device)?;
    let batch = create_mock_batches(3, 1, MockShape::default(), &device)?.remove(0);

    let evaluator = MultiHorizonEvaluator::new(4, 0.1, 1);
    assert!(evaluator.decode(&model, &batch.inputs).is_err());
    Ok(())
}

/// Returns no prediction positions at all
struct SilentModel;

impl FlowModel for SilentModel {
    fn forward(
        &self,
        inputs: &ModelInputs<'_>,
        _training: bool,
        _masks: &AttentionMasks,
    ) -> candle_core::Result<ModelOutput> {
        let batch = inputs.decoder_flow.dim(0)?;
        let device = inputs.decoder_flow.device();
        let attention = Tensor::zeros(1, DType::F32, device)?;
        Ok(ModelOutput {
            predictions: Tensor::zeros((batch, 0, 2), DType::F32, device)?,
            attention_global: attention.clone(),
            attention_local: attention,
        })
    }
}

#[test]
fn test_decode_rejects_empty_predictions() -> Result<()> {
    let device = Device::Cpu;
    let batch = create_mock_batches(3, 1, MockShape::default(), &device)?.remove(0);

    let evaluator = MultiHorizonEvaluator::new(3, 0.1, 1);
    let result = evaluator.decode(&SilentModel, &batch.inputs);
    assert!(matches!(result, Err(Error::Shape(_))));
    Ok(())
}

#[test]
fn test_evaluate_resets_and_accumulates() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::new(&var_map, &device)?;
    let batches = create_mock_batches(8, 2, MockShape::default(), &device)?;

    let evaluator = MultiHorizonEvaluator::new(3, 0.0, 2);
    let mut metrics = HorizonMetrics::new(3);
    evaluator.evaluate(&model, &batches, &mut metrics, false)?;
    let first = metrics.rmse(0, Direction::Inflow);
    let counted = metrics.get(0, Direction::Inflow).rmse.count();
    assert!(counted > 0);
    assert_eq!(metrics.get(0, Direction::Inflow).mae.count(), 0);

    // a second pass starts from scratch
    evaluator.evaluate(&model, &batches, &mut metrics, true)?;
    assert_eq!(metrics.get(0, Direction::Inflow).rmse.count(), counted);
    assert_relative_eq!(metrics.rmse(0, Direction::Inflow), first, epsilon = 1e-9);
    assert_eq!(metrics.get(2, Direction::Outflow).mae.count(), counted);
    Ok(())
}

#[test]
fn test_all_trivial_batch_is_a_no_op() -> Result<()> {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = LinearFlowModel::new(&var_map, &device)?;
    let mut batch: Batch = create_mock_batches(4, 1, MockShape::default(), &device)?.remove(0);
    batch.targets.y = Tensor::full(0.05f32, batch.targets.y.dims(), &device)?;

    let evaluator = MultiHorizonEvaluator::new(3, 0.1, 1);
    let mut metrics = HorizonMetrics::new(3);
    evaluator.evaluate(&model, &vec![batch], &mut metrics, true)?;

    for h in 0..3 {
        for direction in Direction::ALL {
            let m = metrics.get(h, direction);
            assert_eq!(m.rmse.count(), 0);
            assert_eq!(m.mape.count(), 0);
            assert!(m.rmse.result().is_finite());
        }
    }
    Ok(())
}
