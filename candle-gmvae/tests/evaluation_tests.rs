use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tempfile::TempDir;

use candle_gmvae::checkpoint::{CheckpointKind, RunDirectory};
use candle_gmvae::dist_registry::ReconstructionKind;
use candle_gmvae::evaluate::{evaluate, EvalConfig, OutputKind};
use candle_gmvae::gmvae::Gmvae;
use candle_gmvae::learning_curves::load_records;
use candle_gmvae::model_config::GmvaeConfig;
use candle_gmvae::train::{GmvaeTrainer, TrainConfig, TrainOutcome};

use count_data::simulate::{generate_clustered_count_data, split_for_validation, SimArgs};
use count_data::DataVersion;

fn build_model(config: &GmvaeConfig) -> anyhow::Result<(VarMap, Gmvae)> {
    let _ = env_logger::try_init();
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Gmvae::new(config, vs, &device)?;
    Ok((varmap, model))
}

#[test]
fn duplicate_output_kinds_are_rejected_before_any_computation() -> anyhow::Result<()> {
    let config = GmvaeConfig::new(12, 2, vec![8], 3, ReconstructionKind::Bernoulli);
    let (varmap, model) = build_model(&config)?;
    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: 10,
        n_features: 12,
        n_clusters: 3,
        binary: true,
        ..SimArgs::default()
    })?;

    let base = TempDir::new()?;
    let eval_config = EvalConfig {
        output_kinds: vec![OutputKind::Reconstructed, OutputKind::Reconstructed],
        ..EvalConfig::all_outputs("whatever")
    };

    let err = evaluate(&model, &varmap, base.path(), &sim.data_set, &eval_config)
        .expect_err("duplicate kinds must be rejected");
    assert!(err.to_string().contains("duplicate"));

    // too many kinds fail the same way, before any checkpoint access
    let eval_config = EvalConfig {
        output_kinds: vec![
            OutputKind::Transformed,
            OutputKind::Reconstructed,
            OutputKind::Latent,
            OutputKind::Latent,
        ],
        ..EvalConfig::all_outputs("whatever")
    };
    assert!(evaluate(&model, &varmap, base.path(), &sim.data_set, &eval_config).is_err());

    Ok(())
}

#[test]
fn evaluating_an_untrained_run_reports_not_trained() -> anyhow::Result<()> {
    let config = GmvaeConfig::new(12, 2, vec![8], 3, ReconstructionKind::Bernoulli);
    let (varmap, model) = build_model(&config)?;
    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: 10,
        n_features: 12,
        n_clusters: 3,
        binary: true,
        ..SimArgs::default()
    })?;

    let base = TempDir::new()?;
    let outputs = evaluate(
        &model,
        &varmap,
        base.path(),
        &sim.data_set,
        &EvalConfig::all_outputs("missing-run"),
    )?;

    assert!(!outputs.trained);
    assert!(outputs.transformed.is_none());
    assert!(outputs.reconstructed.is_none());
    assert!(outputs.latent.is_none());
    assert!(outputs.metrics.is_none());

    Ok(())
}

/// End-to-end: three well-separated clusters in a 200 x 20 binary
/// matrix, Bernoulli reconstruction, semi-supervised labels on part of
/// the training split.
#[test]
fn clustering_recovers_planted_structure() -> anyhow::Result<()> {
    let mut config = GmvaeConfig::new(20, 2, vec![16], 3, ReconstructionKind::Bernoulli);
    config.n_labeled_examples = 60;

    let (varmap, model) = build_model(&config)?;

    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: 200,
        n_features: 20,
        n_clusters: 3,
        depth: 100.,
        separation: 30.,
        binary: true,
        rseed: 19,
        ..SimArgs::default()
    })?;
    let (training_set, validation_set) = split_for_validation(&sim, 5)?;

    let base = TempDir::new()?;
    let trainer = GmvaeTrainer::new(&model, &varmap, base.path().to_path_buf());
    let train_config = TrainConfig {
        n_epochs: 25,
        batch_size: 20,
        learning_rate: 1e-2,
        run_id: Some("planted".to_string()),
        ..TrainConfig::default()
    };

    let status = trainer.train(&training_set, Some(&validation_set), &train_config, None)?;
    assert_eq!(status.outcome, TrainOutcome::Completed);

    // the best-validation checkpoint tracks the running maximum of the
    // validation bound
    let run_dir = RunDirectory::new(base.path(), &config.model_name(), "planted");
    let best = run_dir
        .checkpoint_meta(CheckpointKind::Best)?
        .expect("best checkpoint saved");
    let records = load_records(&run_dir.learning_curve_path("validation"))?;
    let max_bound = records
        .iter()
        .map(|r| r.lower_bound)
        .fold(f32::NEG_INFINITY, f32::max);
    assert!((records[best.epoch - 1].lower_bound - max_bound).abs() < 1e-6);

    // evaluate the full matrix against the latest checkpoint
    let outputs = evaluate(
        &model,
        &varmap,
        base.path(),
        &sim.data_set,
        &EvalConfig::all_outputs("planted"),
    )?;
    assert!(outputs.trained);

    let latent = outputs.latent.expect("latent outputs requested");
    assert_eq!(latent.y.number_of_examples(), 200);
    assert_eq!(latent.y.number_of_features(), 3);
    assert_eq!(latent.z.number_of_examples(), 200);
    assert_eq!(latent.z.number_of_features(), 2);
    assert_eq!(latent.y.version, DataVersion::LatentY);
    for row in latent.y.values().row_iter() {
        let total: f32 = row.sum();
        assert!((total - 1.).abs() < 1e-4);
    }

    let reconstructed = outputs.reconstructed.expect("reconstruction requested");
    assert_eq!(reconstructed.number_of_examples(), 200);
    assert_eq!(reconstructed.number_of_features(), 20);
    assert!(reconstructed.total_standard_deviations().is_some());
    // a single evaluation draw leaves no explained component
    assert!(reconstructed.explained_standard_deviations().is_none());
    assert!(reconstructed.values().iter().all(|&x| (0. ..=1.).contains(&x)));

    let transformed = outputs.transformed.expect("transformed requested");
    assert!(transformed.values().iter().all(|&x| x == 0. || x == 1.));

    // mapped cluster assignments recover the planted labels
    let metrics = outputs.metrics.expect("metrics for a trained run");
    let accuracy = metrics.accuracy.expect("labels were available");
    assert!(
        accuracy >= 0.9,
        "mapped accuracy {} below 0.9 (ELBO {})",
        accuracy,
        metrics.lower_bound
    );

    let cluster_ids = outputs.predicted_cluster_ids.expect("cluster ids");
    assert_eq!(cluster_ids.len(), 200);
    assert!(cluster_ids.iter().all(|&k| k < 3));

    Ok(())
}
