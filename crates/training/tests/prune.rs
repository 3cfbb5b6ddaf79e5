mod common;

use common::{create_synthetic_tub, small_config, MockPilot, H, W};
use rand::rngs::StdRng;
use rand::SeedableRng;
use training::{
    ArtifactPaths, ModelKind, PrunablePilot, PruneSettings, PruneStop, PruningController,
    TrainConfig, TrainError, TrainRequest, TrainingController,
};
use tub_dataset::{ingest_tubs, ImageGeometry, IngestOptions, RecordStore};

fn settings(max_val_loss: f32) -> PruneSettings {
    PruneSettings {
        percent_per_iteration: 5.0,
        percent_target: 20.0,
        max_val_loss,
        eval_fraction: 0.5,
        batch_size: 3,
        geometry: ImageGeometry::new(W, H, 3),
    }
}

fn store_with_tub(root: &std::path::Path) -> anyhow::Result<RecordStore> {
    let tub = create_synthetic_tub(root, "tub", 20)?;
    let mut store = RecordStore::new();
    let mut rng = StdRng::seed_from_u64(1);
    ingest_tubs(&[tub], &mut store, &IngestOptions::default(), &mut rng);
    Ok(store)
}

#[test]
fn removes_five_percent_per_iteration_until_target() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_with_tub(dir.path())?;
    let artifacts = ArtifactPaths::from_model_path(&dir.path().join("pilot.bin"))?;
    let settings = settings(0.5);
    let eval = settings.eval_frames(&store);
    assert_eq!(eval.sample_count(), 10);

    let mut pilot = MockPilot::new(&[]);
    let mut retrains = 0;
    let report = PruningController::new(settings, &artifacts).run(&mut pilot, &eval, |p| {
        retrains += 1;
        assert!(p.total_channels() < 100);
        Ok(0.1)
    })?;

    let sizes: Vec<_> = report.iterations.iter().map(|it| it.channels_after).collect();
    assert_eq!(sizes, vec![95, 90, 85, 80]);
    assert_eq!(retrains, 4);
    assert_eq!(report.stop, PruneStop::TargetReached);
    assert_eq!(report.final_channels(), 80);
    for channels in [95, 90, 85, 80] {
        assert!(artifacts.pruned(channels).exists());
    }
    Ok(())
}

#[test]
fn stops_when_loss_exceeds_budget() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_with_tub(dir.path())?;
    let artifacts = ArtifactPaths::from_model_path(&dir.path().join("pilot.bin"))?;
    let settings = settings(0.3);
    let eval = settings.eval_frames(&store);

    let mut pilot = MockPilot::new(&[]);
    let report = PruningController::new(settings, &artifacts).run(&mut pilot, &eval, |p| {
        Ok(if p.total_channels() >= 90 { 0.2 } else { 0.3 })
    })?;

    assert_eq!(report.stop, PruneStop::LossBudget);
    assert_eq!(report.iterations.len(), 3);
    assert!(!report.iterations[2].accepted);
    assert_eq!(report.final_channels(), 90);
    assert!(artifacts.pruned(90).exists());
    assert!(!artifacts.pruned(85).exists());
    Ok(())
}

#[test]
fn highest_apoz_channels_go_first() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_with_tub(dir.path())?;
    let artifacts = ArtifactPaths::from_model_path(&dir.path().join("pilot.bin"))?;
    let settings = settings(1.0);
    let eval = settings.eval_frames(&store);

    let mut pilot = MockPilot::new(&[]);
    pilot.channels = vec![10, 90];
    let scores = training::compute_apoz(&pilot, eval.clone())?;
    let best = scores
        .iter()
        .max_by(|a, b| a.apoz.total_cmp(&b.apoz))
        .map(|s| (s.layer, s.channel));
    assert_eq!(best, Some((1, 89)));

    PruningController::new(settings, &artifacts).run(&mut pilot, &eval, |_| Ok(0.0))?;
    // Layer 1 has the higher per-channel scores, so it shrinks first.
    assert_eq!(pilot.channels[0], 10);
    Ok(())
}

#[test]
fn unreadable_evaluation_frames_are_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_with_tub(dir.path())?;
    std::fs::write(dir.path().join("tub/0_cam.png"), b"not a png")?;
    let settings = settings(1.0);
    let eval = settings.eval_frames(&store);

    let sizes: Vec<_> = eval.clone().map(|batch| batch.batch()).collect();
    assert_eq!(sizes, vec![2, 3, 3, 1]);
    let scores = training::compute_apoz(&MockPilot::new(&[]), eval)?;
    assert_eq!(scores.len(), 100);
    Ok(())
}

#[test]
fn empty_evaluation_subset_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let artifacts = ArtifactPaths::from_model_path(&dir.path().join("pilot.bin"))?;
    let settings = settings(1.0);
    let eval = settings.eval_frames(&RecordStore::new());

    let mut pilot = MockPilot::new(&[]);
    let err = PruningController::new(settings, &artifacts)
        .run(&mut pilot, &eval, |_| Ok(0.0))
        .expect_err("pruned without data");
    assert!(matches!(err, TrainError::EmptyEvaluation));
    Ok(())
}

#[test]
fn controller_prunes_after_training() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let tub = create_synthetic_tub(dir.path(), "tub", 40)?;
    let cfg = TrainConfig {
        max_epochs: 2,
        prune_percent_per_iteration: 10.0,
        prune_percent_target: 20.0,
        prune_val_loss_degradation_limit: 0.2,
        prune_eval_percent_of_dataset: 0.25,
        ..small_config()
    };
    let mut pilot = MockPilot::new(&[0.4, 0.3]);
    pilot.degrade_below = Some((85, 0.9));
    let mut controller = TrainingController::new(cfg, pilot);
    let model = dir.path().join("pilot.bin");
    let report = controller.run(&TrainRequest::new(vec![tub], &model, ModelKind::Linear))?;

    let pruned = controller.prune(&report)?;
    // Ceiling is 0.3 + 0.2; the 90-channel model passes, the 80-channel one does not.
    assert_eq!(pruned.iterations.len(), 2);
    assert_eq!(pruned.stop, PruneStop::LossBudget);
    assert_eq!(pruned.final_channels(), 90);
    assert!(dir.path().join("pilot_prune_90_filters.bin").exists());
    assert!(controller.pilot().compiled >= 3);
    Ok(())
}

#[test]
fn pruning_requires_a_training_run() {
    let mut controller = TrainingController::new(small_config(), MockPilot::new(&[]));
    let report = training::TrainReport {
        history: Vec::new(),
        best_loss: f32::INFINITY,
        epochs_run: 0,
        stop_reason: training::StopReason::EpochBudget,
        train_samples: 0,
        val_samples: 0,
        steps_per_epoch: 0,
        val_steps: 0,
    };
    assert!(controller.prune(&report).is_err());
}
