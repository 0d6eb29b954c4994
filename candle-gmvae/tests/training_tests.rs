use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tempfile::TempDir;

use candle_gmvae::checkpoint::{CheckpointKind, CheckpointMeta, RunDirectory};
use candle_gmvae::data_loader::{DataLoader, InMemoryData};
use candle_gmvae::dist_registry::ReconstructionKind;
use candle_gmvae::gmvae::Gmvae;
use candle_gmvae::learning_curves::*;
use candle_gmvae::model_config::GmvaeConfig;
use candle_gmvae::train::{should_analyse, GmvaeTrainer, TrainConfig, TrainOutcome};

use count_data::simulate::{generate_clustered_count_data, split_for_validation, SimArgs};
use count_data::DataSet;

fn small_config() -> GmvaeConfig {
    GmvaeConfig::new(12, 2, vec![8], 3, ReconstructionKind::Bernoulli)
}

fn build_model(config: &GmvaeConfig) -> anyhow::Result<(VarMap, Gmvae)> {
    let _ = env_logger::try_init();
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Gmvae::new(config, vs, &device)?;
    Ok((varmap, model))
}

fn simulated_splits(n: usize, d: usize) -> anyhow::Result<(DataSet, DataSet)> {
    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: n,
        n_features: d,
        n_clusters: 3,
        binary: true,
        rseed: 5,
        ..SimArgs::default()
    })?;
    split_for_validation(&sim, 4)
}

#[test]
fn training_writes_checkpoints_and_learning_curves() -> anyhow::Result<()> {
    let config = small_config();
    let (varmap, model) = build_model(&config)?;
    let (training_set, validation_set) = simulated_splits(80, config.n_features)?;

    let base = TempDir::new()?;
    let trainer = GmvaeTrainer::new(&model, &varmap, base.path().to_path_buf());

    let train_config = TrainConfig {
        n_epochs: 2,
        batch_size: 20,
        learning_rate: 1e-3,
        run_id: Some("test-run".to_string()),
        ..TrainConfig::default()
    };

    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::Completed);
    assert_eq!(status.run_id, "test-run");
    assert_eq!(status.epochs_trained, (0, 2));

    let run_dir = RunDirectory::new(base.path(), &config.model_name(), "test-run");
    let meta = run_dir
        .checkpoint_meta(CheckpointKind::Latest)?
        .expect("latest checkpoint");
    assert_eq!(meta.epoch, 2);
    assert_eq!(meta.global_step, 6); // 3 minibatches per epoch

    // a validation run keeps a best-model snapshot as well
    assert!(run_dir.checkpoint_meta(CheckpointKind::Best)?.is_some());

    for split in ["training", "validation"] {
        let records = load_records(&run_dir.learning_curve_path(split))?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].epoch, 0);
        assert_eq!(records[1].epoch, 1);
        assert!(records.iter().all(|r| r.lower_bound.is_finite()));
        assert!(records.iter().all(|r| r.accuracy.is_some()));
    }

    Ok(())
}

#[test]
fn resuming_past_the_target_epoch_short_circuits() -> anyhow::Result<()> {
    let config = small_config();
    let (varmap, model) = build_model(&config)?;
    let (training_set, validation_set) = simulated_splits(60, config.n_features)?;

    let base = TempDir::new()?;
    let trainer = GmvaeTrainer::new(&model, &varmap, base.path().to_path_buf());

    let mut train_config = TrainConfig {
        n_epochs: 2,
        batch_size: 20,
        run_id: Some("resume-run".to_string()),
        ..TrainConfig::default()
    };
    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::Completed);

    let run_dir = RunDirectory::new(base.path(), &config.model_name(), "resume-run");
    let before = run_dir
        .checkpoint_meta(CheckpointKind::Latest)?
        .expect("latest checkpoint");

    // same target: nothing left to do
    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::AlreadyTrained);

    // a smaller target is already satisfied too
    train_config.n_epochs = 1;
    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::AlreadyTrained);
    assert_eq!(status.epochs_trained, (2, 1));

    // zero additional optimiser steps were performed
    let after = run_dir
        .checkpoint_meta(CheckpointKind::Latest)?
        .expect("latest checkpoint");
    assert_eq!(before, after);

    Ok(())
}

#[test]
fn nan_loss_aborts_with_a_reportable_status() -> anyhow::Result<()> {
    let config = small_config();
    let (varmap, model) = build_model(&config)?;
    let (training_set, validation_set) = simulated_splits(60, config.n_features)?;

    let base = TempDir::new()?;
    let trainer = GmvaeTrainer::new(&model, &varmap, base.path().to_path_buf());

    // a NaN learning rate poisons the parameters after the first
    // update, so the next monitored loss is NaN
    let train_config = TrainConfig {
        n_epochs: 10,
        batch_size: 20,
        learning_rate: f32::NAN,
        run_id: Some("nan-run".to_string()),
        ..TrainConfig::default()
    };

    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::FailedNaN);
    assert!(!status.completed());
    assert!(status.message.as_deref().unwrap_or("").contains("nan"));
    assert_eq!(status.epochs_trained, (0, 0));
    assert!(status.training_duration.is_some());

    Ok(())
}

#[test]
fn early_stopping_counts_and_freezes() {
    let rounds = 3;
    let mut state = EarlyStoppingState::default();

    assert_eq!(state.observe(1.0, rounds), EarlyStoppingAction::Discard);
    assert!(!state.stopped_early);

    // first degradation freezes the pre-degradation snapshot
    assert_eq!(state.observe(0.5, rounds), EarlyStoppingAction::Snapshot);
    assert_eq!(state.epochs_with_no_improvement, 1);

    assert_eq!(state.observe(0.4, rounds), EarlyStoppingAction::None);
    assert_eq!(state.observe(0.3, rounds), EarlyStoppingAction::None);
    assert!(state.stopped_early);

    // the trigger is sticky: later improvements change nothing
    assert_eq!(state.observe(2.0, rounds), EarlyStoppingAction::None);
    assert!(state.stopped_early);
    assert_eq!(state.epochs_with_no_improvement, 3);
}

#[test]
fn early_stopping_counter_resets_on_improvement() {
    let rounds = 3;
    let mut state = EarlyStoppingState::default();

    state.observe(1.0, rounds);
    assert_eq!(state.observe(0.5, rounds), EarlyStoppingAction::Snapshot);
    // recovery discards the stale snapshot and resets the counter
    assert_eq!(state.observe(1.5, rounds), EarlyStoppingAction::Discard);
    assert_eq!(state.epochs_with_no_improvement, 0);
    assert!(!state.stopped_early);
}

#[test]
fn early_stopping_state_recovers_from_the_curve() {
    let lower_bounds = [1.0f32, 1.2, 0.8, 0.7, 1.3, 1.1, 1.0, 0.9];
    let records: Vec<EpochRecord> = lower_bounds
        .iter()
        .enumerate()
        .map(|(epoch, &lower_bound)| EpochRecord {
            epoch,
            lower_bound,
            reconstruction_error: 0.,
            kl_divergence_z: 0.,
            kl_divergence_y: 0.,
            clf_error: 0.,
            accuracy: None,
            kl_divergence_z_clusters: vec![],
        })
        .collect();

    let recovered = recover_early_stopping_state(&records, 3);

    // replaying the rule by hand gives the same state
    let mut replayed = EarlyStoppingState::default();
    for r in &records {
        replayed.observe_best(r.lower_bound as f64);
        replayed.observe(r.lower_bound as f64, 3);
    }
    assert_eq!(recovered, replayed);
    assert!(!recovered.stopped_early);
    assert_eq!(recovered.epochs_with_no_improvement, 2);
    assert_eq!(recovered.best_lower_bound, 1.3f32 as f64);
}

#[test]
fn checkpoints_restore_parameters_exactly() -> anyhow::Result<()> {
    let config = small_config();
    let (varmap_a, model_a) = build_model(&config)?;
    let (varmap_b, model_b) = build_model(&config)?;

    let base = TempDir::new()?;
    let run_dir = RunDirectory::new(base.path(), &config.model_name(), "ckpt");
    run_dir.save_checkpoint(
        &varmap_a,
        CheckpointKind::Latest,
        CheckpointMeta {
            epoch: 5,
            global_step: 100,
        },
    )?;

    let meta = run_dir
        .load_checkpoint(&varmap_b, CheckpointKind::Latest)?
        .expect("checkpoint written");
    assert_eq!(meta.epoch, 5);
    assert_eq!(meta.global_step, 100);

    // both models now compute identical cluster posteriors
    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: 16,
        n_features: config.n_features,
        n_clusters: 3,
        binary: true,
        rseed: 23,
        ..SimArgs::default()
    })?;
    let loader = InMemoryData::from_data_set(&config, &sim.data_set)?;
    let mb = loader.minibatch_ordered(0, 16, model_a.device())?;

    let logits_a = model_a
        .forward_t(&mb, &config.training_samples, false)?
        .y_posterior
        .logits_nc
        .to_vec2::<f32>()?;
    let logits_b = model_b
        .forward_t(&mb, &config.training_samples, false)?
        .y_posterior
        .logits_nc
        .to_vec2::<f32>()?;

    for (row_a, row_b) in logits_a.iter().zip(logits_b.iter()) {
        for (a, b) in row_a.iter().zip(row_b.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    Ok(())
}

#[test]
fn staged_runs_move_to_the_permanent_location_on_success() -> anyhow::Result<()> {
    let config = small_config();
    let (varmap, model) = build_model(&config)?;
    let (training_set, validation_set) = simulated_splits(60, config.n_features)?;

    let base = TempDir::new()?;
    let staging = TempDir::new()?;
    let trainer = GmvaeTrainer::new(&model, &varmap, base.path().to_path_buf());

    let train_config = TrainConfig {
        n_epochs: 1,
        batch_size: 20,
        run_id: Some("staged".to_string()),
        temporary_log_directory: Some(staging.path().to_path_buf()),
        ..TrainConfig::default()
    };

    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::Completed);

    let permanent = RunDirectory::new(base.path(), &config.model_name(), "staged");
    assert!(permanent.checkpoint_meta(CheckpointKind::Latest)?.is_some());

    let staged = RunDirectory::new(staging.path(), &config.model_name(), "staged");
    assert!(!staged.exists());

    Ok(())
}

#[test]
fn analysis_cadence_thins_out_with_epoch_count() {
    // every epoch for the first ten
    assert!((0..10).all(|e| should_analyse(e, 2000, None)));
    // every 10th up to 100
    assert!(should_analyse(19, 2000, None));
    assert!(!should_analyse(14, 2000, None));
    // every 50th up to 1000
    assert!(should_analyse(149, 2000, None));
    assert!(!should_analyse(151, 2000, None));
    // every 100th beyond
    assert!(should_analyse(1099, 2000, None));
    assert!(!should_analyse(1050, 2000, None));
    // always the final epoch
    assert!(should_analyse(1993, 1994, None));
    // a fixed override wins
    assert!(should_analyse(4, 2000, Some(2)));
    assert!(!should_analyse(5, 2000, Some(2)));
}
