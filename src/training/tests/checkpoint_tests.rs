//! Tests for checkpoint persistence and retention

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{Init, VarMap};

use crate::error::Error;
use crate::training::checkpoints::{read_snapshot_header, CheckpointRecord, CheckpointStore, RECORD_FILE};
use crate::training::early_stop::{EarlyStopController, EarlyStopState};
use crate::training::optimizers::{Adam, AdamParams, ConstantSchedule, Optimizer};
use crate::training::reshuffle::ReshuffleState;
use crate::training::trainer::TrainingState;

fn var_map() -> Result<VarMap> {
    let var_map = VarMap::new();
    var_map.get((3,), "w", Init::Const(1.0), DType::F32, &Device::Cpu)?;
    Ok(var_map)
}

fn adam(var_map: &VarMap) -> Result<Adam> {
    Ok(Adam::new(var_map, AdamParams::default(), Box::new(ConstantSchedule(0.01)))?)
}

fn set_weights(var_map: &VarMap, value: f32) -> Result<()> {
    let var = &var_map.all_vars()[0];
    var.set(&var.as_tensor().ones_like()?.affine(value as f64, 0.0)?)?;
    Ok(())
}

fn weights(var_map: &VarMap) -> Result<Vec<f32>> {
    Ok(var_map.all_vars()[0].as_tensor().to_vec1()?)
}

fn state(epoch: usize) -> TrainingState {
    TrainingState {
        epoch,
        step_count: epoch * 10,
        early_stop_flag: false,
        checkpoint_eligible_flag: epoch > 1,
        best_epoch: epoch.saturating_sub(1),
    }
}

fn save_epochs(store: &mut CheckpointStore, var_map: &VarMap, epochs: std::ops::RangeInclusive<usize>) -> Result<()> {
    let optimizer = adam(var_map)?;
    for epoch in epochs {
        set_weights(var_map, epoch as f32)?;
        store.save(
            &state(epoch),
            &EarlyStopState::default(),
            &ReshuffleState::default(),
            var_map,
            &optimizer,
        )?;
    }
    Ok(())
}

#[test]
fn test_missing_record_is_fresh_start() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path().join("ckpt"), 3)?;
    let mut var_map = var_map()?;
    let mut optimizer = adam(&var_map)?;

    assert!(store.load(&mut var_map, &mut optimizer)?.is_none());
    assert!(CheckpointRecord::read(store.dir())?.is_none());
    assert!(store.retained_epochs().is_empty());
    Ok(())
}

#[test]
fn test_retention_keeps_most_recent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 3)?;
    let var_map = var_map()?;
    save_epochs(&mut store, &var_map, 1..=5)?;

    assert_eq!(store.retained_epochs(), vec![3, 4, 5]);
    assert_eq!(store.oldest_epoch(), Some(3));
    assert_eq!(store.latest_epoch(), Some(5));
    assert!(!dir.path().join("ckpt-1.safetensors").exists());
    assert!(!dir.path().join("ckpt-2.optim.safetensors").exists());

    let record = CheckpointRecord::read(dir.path())?.expect("record");
    assert_eq!(record.epoch, 5);
    assert_eq!(record.snapshots.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
    Ok(())
}

#[test]
fn test_best_epoch_snapshot_outlives_the_window() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 3)?;
    let var_map = var_map()?;
    let optimizer = adam(&var_map)?;
    let mut save = |epoch: usize, best_epoch: usize| -> Result<()> {
        set_weights(&var_map, epoch as f32)?;
        let progress = TrainingState {
            best_epoch,
            ..state(epoch)
        };
        store.save(&progress, &EarlyStopState::default(), &ReshuffleState::default(), &var_map, &optimizer)?;
        Ok(())
    };

    for epoch in 1..=6 {
        save(epoch, 2.min(epoch))?;
    }
    let record = CheckpointRecord::read(dir.path())?.expect("record");
    assert_eq!(record.snapshots.keys().copied().collect::<Vec<_>>(), vec![2, 4, 5, 6]);
    assert!(dir.path().join("ckpt-2.safetensors").is_file());
    assert!(!dir.path().join("ckpt-3.safetensors").exists());

    // a newer best releases the old one
    save(7, 7)?;
    drop(save);
    assert_eq!(store.retained_epochs(), vec![5, 6, 7]);
    assert!(!dir.path().join("ckpt-2.safetensors").exists());
    Ok(())
}

#[test]
fn test_load_sweeps_unlisted_snapshots() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 2)?;
    let mut var_map = var_map()?;
    save_epochs(&mut store, &var_map, 1..=3)?;

    // files of an eviction that never ran
    std::fs::copy(dir.path().join("ckpt-3.safetensors"), dir.path().join("ckpt-1.safetensors"))?;
    std::fs::copy(
        dir.path().join("ckpt-3.optim.safetensors"),
        dir.path().join("ckpt-1.optim.safetensors"),
    )?;

    let mut optimizer = adam(&var_map)?;
    let mut reopened = CheckpointStore::new(dir.path(), 2)?;
    reopened.load(&mut var_map, &mut optimizer)?.expect("resume point");

    assert!(!dir.path().join("ckpt-1.safetensors").exists());
    assert!(!dir.path().join("ckpt-1.optim.safetensors").exists());
    assert!(dir.path().join("ckpt-2.safetensors").is_file());
    assert!(dir.path().join(RECORD_FILE).is_file());
    assert_eq!(reopened.retained_epochs(), vec![2, 3]);
    Ok(())
}

#[test]
fn test_record_never_names_missing_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 2)?;
    let var_map = var_map()?;
    save_epochs(&mut store, &var_map, 1..=4)?;

    let record = CheckpointRecord::read(dir.path())?.expect("record");
    for snapshot in record.snapshots.values() {
        assert!(dir.path().join(snapshot.weights_file()).is_file());
        assert!(dir.path().join(snapshot.optimizer_file()).is_file());
    }

    // no temporary files are left behind
    for entry in std::fs::read_dir(dir.path())? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with(".tmp"), "left over {name}");
    }
    Ok(())
}

#[test]
fn test_load_restores_latest_snapshot_and_progress() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let var_map = var_map()?;
    let mut optimizer = adam(&var_map)?;
    let grads = var_map.all_vars()[0].as_tensor().sum_all()?.backward()?;
    optimizer.step(&grads)?;

    let mut controller = EarlyStopController::new([5, 2], 0.1);
    controller.check(1.0, 0);
    controller.check(0.95, 1);
    let reshuffler = ReshuffleState {
        reshuffles: 1,
        last_epoch: Some(1),
    };

    let mut store = CheckpointStore::new(dir.path(), 3)?;
    let saved_weights = weights(&var_map)?;
    store.save(&state(2), controller.state(), &reshuffler, &var_map, &optimizer)?;

    set_weights(&var_map, 42.0)?;

    let mut reopened = CheckpointStore::new(dir.path(), 3)?;
    let mut restored_map = var_map.clone();
    let mut restored_optimizer = adam(&restored_map)?;
    let point = reopened
        .load(&mut restored_map, &mut restored_optimizer)?
        .expect("resume point");

    assert_eq!(point.state, state(2));
    assert_eq!(&point.early_stopper, controller.state());
    assert_eq!(point.reshuffler, reshuffler);
    assert_eq!(weights(&restored_map)?, saved_weights);
    assert_eq!(restored_optimizer.step_count(), state(2).step_count);
    assert_eq!(reopened.retained_epochs(), vec![2]);
    Ok(())
}

#[test]
fn test_restore_by_epoch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 3)?;
    let mut var_map = var_map()?;
    save_epochs(&mut store, &var_map, 1..=3)?;

    let mut optimizer = adam(&var_map)?;
    store.restore(2, &mut var_map, &mut optimizer)?;
    assert_eq!(weights(&var_map)?, vec![2.0; 3]);
    assert_eq!(optimizer.step_count(), 20);

    assert!(matches!(
        store.restore(7, &mut var_map, &mut optimizer),
        Err(Error::Checkpoint(_))
    ));
    Ok(())
}

#[test]
fn test_record_without_snapshot_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 3)?;
    let mut var_map = var_map()?;
    save_epochs(&mut store, &var_map, 1..=1)?;

    let mut record = CheckpointRecord::read(dir.path())?.expect("record");
    record.epoch = 9;
    std::fs::write(dir.path().join(RECORD_FILE), serde_json::to_string(&record)?)?;

    let mut optimizer = adam(&var_map)?;
    let mut reopened = CheckpointStore::new(dir.path(), 3)?;
    assert!(matches!(
        reopened.load(&mut var_map, &mut optimizer),
        Err(Error::Checkpoint(_))
    ));
    Ok(())
}

#[test]
fn test_snapshot_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = CheckpointStore::new(dir.path(), 1)?;
    let var_map = var_map()?;
    save_epochs(&mut store, &var_map, 1..=1)?;

    let path = store.weights_path(1).expect("snapshot");
    let tensors = read_snapshot_header(&path)?;
    assert_eq!(tensors.len(), 1);
    assert_eq!(tensors[0].name, "w");
    assert_eq!(tensors[0].shape, vec![3]);
    Ok(())
}

#[test]
fn test_zero_retention_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(CheckpointStore::new(dir.path(), 0), Err(Error::Config(_))));
}
