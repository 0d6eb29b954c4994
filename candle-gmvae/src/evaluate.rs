#![allow(dead_code)]

use std::path::Path;

use candle_nn::VarMap;
use count_data::{DataSet, DataSetArgs, DataVersion, Mat};
use log::{info, warn};
use serde::Serialize;

use crate::checkpoint::{clear_directory, CheckpointKind, RunDirectory};
use crate::data_loader::{DataLoader, InMemoryData};
use crate::gmvae::Gmvae;
use crate::loss::{compute_loss, LossWeights};
use crate::prediction::{accuracy, map_cluster_ids_to_label_ids};

/// The result views evaluation can produce, at most once each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// the targets the model was scored against (e.g. binarised)
    Transformed,
    /// reconstructed means with predictive uncertainty
    Reconstructed,
    /// posterior mean embedding and responsibilities
    Latent,
}

pub struct EvalConfig {
    pub batch_size: usize,
    pub output_kinds: Vec<OutputKind>,
    pub predict_labels: bool,
    pub checkpoint: CheckpointKind,
    /// write a summary record under the run's `evaluation/` directory
    pub log_results: bool,
    pub run_id: String,
}

impl EvalConfig {
    pub fn all_outputs(run_id: &str) -> Self {
        Self {
            batch_size: 100,
            output_kinds: vec![
                OutputKind::Transformed,
                OutputKind::Reconstructed,
                OutputKind::Latent,
            ],
            predict_labels: true,
            checkpoint: CheckpointKind::Latest,
            log_results: true,
            run_id: run_id.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct LatentRepresentation {
    pub z: DataSet,
    pub y: DataSet,
}

#[derive(Clone, Debug, Serialize)]
pub struct EvalMetrics {
    pub epoch: usize,
    pub lower_bound: f32,
    pub reconstruction_error: f32,
    pub kl_divergence_z: f32,
    pub kl_divergence_y: f32,
    pub accuracy: Option<f32>,
}

/// Evaluation results; every field stays `None` when its output kind
/// was not requested, or when the run has no matching checkpoint
/// (`trained == false`).
#[derive(Debug)]
pub struct EvaluationOutputs {
    pub trained: bool,
    pub transformed: Option<DataSet>,
    pub reconstructed: Option<DataSet>,
    pub latent: Option<LatentRepresentation>,
    pub metrics: Option<EvalMetrics>,
    pub predicted_cluster_ids: Option<Vec<usize>>,
    pub predicted_labels: Option<Vec<String>>,
}

impl EvaluationOutputs {
    fn not_trained() -> Self {
        Self {
            trained: false,
            transformed: None,
            reconstructed: None,
            latent: None,
            metrics: None,
            predicted_cluster_ids: None,
            predicted_labels: None,
        }
    }
}

/// Batched forward inference against a stored checkpoint. Never
/// touches the training side of the run directory; summaries go into
/// the checkpoint's own `evaluation/` subdirectory.
pub fn evaluate(
    model: &Gmvae,
    varmap: &VarMap,
    base_log_directory: &Path,
    evaluation_set: &DataSet,
    eval_config: &EvalConfig,
) -> anyhow::Result<EvaluationOutputs> {
    // argument validation happens before any computation or IO
    anyhow::ensure!(
        eval_config.output_kinds.len() <= 3,
        "can only produce at most 3 output kinds, {} requested",
        eval_config.output_kinds.len()
    );
    for (i, kind) in eval_config.output_kinds.iter().enumerate() {
        anyhow::ensure!(
            !eval_config.output_kinds[..i].contains(kind),
            "cannot produce duplicate output kinds: {:?} requested twice",
            kind
        );
    }

    let config = model.config();
    let device = model.device();
    let run_dir = RunDirectory::new(base_log_directory, &config.model_name(), &eval_config.run_id);

    let meta = match run_dir.load_checkpoint(varmap, eval_config.checkpoint)? {
        Some(meta) => meta,
        None => {
            warn!(
                "cannot evaluate run {}: no {:?} checkpoint",
                eval_config.run_id, eval_config.checkpoint
            );
            return Ok(EvaluationOutputs::not_trained());
        }
    };

    info!(
        "evaluating run {} at epoch {} on the {} set",
        eval_config.run_id,
        meta.epoch,
        evaluation_set.kind.as_str()
    );

    let loader = InMemoryData::from_data_set(config, evaluation_set)?;
    let m = loader.num_data();
    let d = config.n_features;
    let samples = &config.evaluation_samples;
    let s = samples.total();
    let n_batches = m.div_ceil(eval_config.batch_size);

    let want_reconstruction = eval_config.output_kinds.contains(&OutputKind::Reconstructed);
    let want_latent = eval_config.output_kinds.contains(&OutputKind::Latent);

    let weights = LossWeights {
        warm_up: 1.,
        kl_weight: config.kl_weight,
        clf_weight: config.clf_weight,
    };

    let mut lower_bound = 0f64;
    let mut reconstruction_error = 0f64;
    let mut kl_z = 0f64;
    let mut kl_y = 0f64;

    let mut cluster_ids = Vec::with_capacity(m);
    let mut z_mean = Mat::zeros(m, config.n_latent);
    let mut responsibilities = Mat::zeros(m, config.n_clusters);
    let mut p_x_mean = Mat::zeros(m, d);
    let mut mean_of_variances = Mat::zeros(m, d);
    let mut variance_of_means = Mat::zeros(m, d);

    for b in 0..n_batches {
        let mb = loader.minibatch_ordered(b, eval_config.batch_size, device)?;
        let n = mb.batch_size();
        let forward = model.forward_t(&mb, samples, false)?;
        let loss = compute_loss(
            &forward,
            &mb,
            samples,
            &weights,
            model.cluster_prior(),
            config.proportion_of_free_nats,
        )?;

        lower_bound += loss.lower_bound as f64;
        reconstruction_error += loss.reconstruction_error as f64;
        kl_z += loss.kl_divergence_z as f64;
        kl_y += loss.kl_divergence_y as f64;

        let offset = b * eval_config.batch_size;
        cluster_ids.extend(forward.y_posterior.arg_max()?);

        if want_latent {
            copy_rows(&mut responsibilities, offset, forward.y_posterior.probs()?.to_vec2()?);
            copy_rows(&mut z_mean, offset, forward.z_mean_nl.to_vec2()?);
        }

        if want_reconstruction {
            let pi_nc = forward.y_posterior.probs()?;
            let mut mean_nf = candle_core::Tensor::zeros((n, d), mb.input.dtype(), device)?;
            let mut mean_var_nf = mean_nf.clone();
            let mut var_mean_nf = mean_nf.clone();

            for (k, cluster) in forward.clusters.iter().enumerate() {
                let pi_k_n1 = pi_nc.narrow(1, k, 1)?;
                let mean_snf = cluster.px.mean()?.reshape((s, n, d))?;
                let var_snf = cluster.px.variance()?.reshape((s, n, d))?;

                // marginalised conditional mean E[x] per cluster
                let mean_k_nf = mean_snf.mean(0)?.broadcast_mul(&pi_k_n1)?;
                mean_nf = mean_nf.add(&mean_k_nf)?;

                // E[V[x|z]] and V[E[x|z]] components of the
                // predictive uncertainty
                mean_var_nf =
                    mean_var_nf.add(&var_snf.mean(0)?.broadcast_mul(&pi_k_n1)?)?;
                let centred = mean_snf.broadcast_sub(&mean_k_nf.unsqueeze(0)?)?;
                var_mean_nf =
                    var_mean_nf.add(&centred.sqr()?.mean(0)?.broadcast_mul(&pi_k_n1)?)?;
            }

            copy_rows(&mut p_x_mean, offset, mean_nf.to_vec2()?);
            copy_rows(&mut mean_of_variances, offset, mean_var_nf.to_vec2()?);
            copy_rows(&mut variance_of_means, offset, var_mean_nf.to_vec2()?);
        }
    }

    let norm = n_batches as f64;
    let mut metrics = EvalMetrics {
        epoch: meta.epoch,
        lower_bound: (lower_bound / norm) as f32,
        reconstruction_error: (reconstruction_error / norm) as f32,
        kl_divergence_z: (kl_z / norm) as f32,
        kl_divergence_y: (kl_y / norm) as f32,
        accuracy: None,
    };

    // cluster -> label mapping through the best-matching collaborator
    let label_ids = evaluation_set.label_ids();
    let excluded = evaluation_set.excluded_class_ids();
    let predicted_label_ids = label_ids
        .as_ref()
        .map(|ids| map_cluster_ids_to_label_ids(ids, &cluster_ids, &excluded));
    if let (Some(ids), Some(predicted)) = (label_ids.as_ref(), predicted_label_ids.as_ref()) {
        metrics.accuracy = Some(accuracy(ids, predicted, &excluded));
    }
    let predicted_labels = match (eval_config.predict_labels, predicted_label_ids.as_ref()) {
        (true, Some(predicted)) => Some(
            predicted
                .iter()
                .map(|&id| {
                    evaluation_set
                        .class_id_to_name(id)
                        .unwrap_or("unknown")
                        .to_string()
                })
                .collect::<Vec<String>>(),
        ),
        _ => None,
    };

    let mut outputs = EvaluationOutputs {
        trained: true,
        transformed: None,
        reconstructed: None,
        latent: None,
        metrics: Some(metrics.clone()),
        predicted_cluster_ids: Some(cluster_ids.clone()),
        predicted_labels: predicted_labels.clone(),
    };

    let attach_predictions = |data_set: &mut DataSet| {
        data_set.update_predictions(Some(cluster_ids.clone()), predicted_labels.clone());
    };

    for kind in eval_config.output_kinds.iter() {
        match kind {
            OutputKind::Transformed => {
                let values = if config.reconstruction.binarised_target() {
                    evaluation_set.binarised_values()
                } else {
                    evaluation_set.values().clone()
                };
                let mut transformed = evaluation_set.derive(
                    DataVersion::Transformed,
                    values,
                    Some(evaluation_set.feature_names().to_vec()),
                )?;
                attach_predictions(&mut transformed);
                outputs.transformed = Some(transformed);
            }
            OutputKind::Reconstructed => {
                let explained = if s > 1 {
                    Some(variance_of_means.map(|v| v.max(0.).sqrt()))
                } else {
                    // a single draw explains nothing
                    None
                };
                let total = (&mean_of_variances + &variance_of_means).map(|v| v.max(0.).sqrt());
                let mut reconstructed = DataSet::new(DataSetArgs {
                    name: evaluation_set.name.clone(),
                    kind: evaluation_set.kind,
                    version: DataVersion::Reconstructed,
                    values: p_x_mean.clone(),
                    labels: evaluation_set.labels().cloned(),
                    superset_labels: evaluation_set.superset_labels().cloned(),
                    excluded_classes: evaluation_set.excluded_classes().to_vec(),
                    example_names: Some(evaluation_set.example_names().to_vec()),
                    feature_names: Some(evaluation_set.feature_names().to_vec()),
                    total_standard_deviations: Some(total),
                    explained_standard_deviations: explained,
                    ..DataSetArgs::default()
                })?;
                attach_predictions(&mut reconstructed);
                outputs.reconstructed = Some(reconstructed);
            }
            OutputKind::Latent => {
                let z_names: Vec<String> = (0..config.n_latent)
                    .map(|l| format!("z variable {}", l + 1))
                    .collect();
                let y_names: Vec<String> = (0..config.n_clusters)
                    .map(|k| format!("y variable {}", k + 1))
                    .collect();
                let mut z =
                    evaluation_set.derive(DataVersion::LatentZ, z_mean.clone(), Some(z_names))?;
                let mut y = evaluation_set.derive(
                    DataVersion::LatentY,
                    responsibilities.clone(),
                    Some(y_names),
                )?;
                attach_predictions(&mut z);
                attach_predictions(&mut y);
                outputs.latent = Some(LatentRepresentation { z, y });
            }
        }
    }

    if eval_config.log_results {
        let summary_dir = run_dir.evaluation_dir(eval_config.checkpoint);
        clear_directory(&summary_dir)?;
        std::fs::create_dir_all(&summary_dir)?;
        std::fs::write(
            summary_dir.join("summary.json"),
            serde_json::to_string_pretty(&metrics)?,
        )?;
    }

    Ok(outputs)
}

fn copy_rows(target: &mut Mat, offset: usize, rows: Vec<Vec<f32>>) {
    for (i, row) in rows.into_iter().enumerate() {
        for (j, v) in row.into_iter().enumerate() {
            target[(offset + i, j)] = v;
        }
    }
}
