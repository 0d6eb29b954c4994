#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, VarMap};
use count_data::{DataSet, Mat};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

use crate::checkpoint::*;
use crate::data_loader::{DataLoader, InMemoryData};
use crate::gmvae::Gmvae;
use crate::learning_curves::*;
use crate::loss::{compute_loss, LossWeights};
use crate::model_config::{GmvaeConfig, SampleCounts};
use crate::prediction::{accuracy, map_cluster_ids_to_label_ids};

pub struct TrainConfig {
    pub n_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// resume (or create) this run; without an id, training uses one
    /// shared unnamed run unless `new_run` asks for a fresh one
    pub run_id: Option<String>,
    /// force a fresh run with a generated id when no id is given
    pub new_run: bool,
    /// wipe any earlier state of the run before training
    pub reset_training: bool,
    /// stage the run here and only move it to the permanent location
    /// on successful completion
    pub temporary_log_directory: Option<PathBuf>,
    /// fixed reporting cadence; the default schedule thins out with
    /// epoch count
    pub analysis_interval: Option<usize>,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epochs: 100,
            batch_size: 100,
            learning_rate: 1e-3,
            run_id: None,
            new_run: false,
            reset_training: false,
            temporary_log_directory: None,
            analysis_interval: None,
            show_progress: false,
            verbose: false,
        }
    }
}

/// Terminal state of one `train` call. A NaN loss is a reportable
/// outcome, not a crash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainOutcome {
    Completed,
    /// the restored checkpoint already met the requested epoch count
    AlreadyTrained,
    FailedNaN,
}

#[derive(Clone, Debug)]
pub struct TrainStatus {
    pub outcome: TrainOutcome,
    pub message: Option<String>,
    pub run_id: String,
    /// `(first epoch this call ran, requested epoch count)`
    pub epochs_trained: (usize, usize),
    pub training_duration: Option<Duration>,
    pub last_epoch_duration: Option<Duration>,
}

impl TrainStatus {
    pub fn completed(&self) -> bool {
        matches!(
            self.outcome,
            TrainOutcome::Completed | TrainOutcome::AlreadyTrained
        )
    }
}

/// Per-cluster latent summaries for monitoring and downstream
/// plotting.
#[derive(Clone, Debug, Default)]
pub struct LatentCentroids {
    pub prior_probabilities: Vec<f32>,
    pub posterior_probabilities: Vec<f32>,
    /// `[cluster][latent dimension]`
    pub prior_means: Vec<Vec<f32>>,
    pub prior_variances: Vec<Vec<f32>>,
    pub posterior_means: Vec<Vec<f32>>,
    pub posterior_variances: Vec<Vec<f32>>,
}

/// Result of one full batched pass over a split with no gradient
/// updates.
pub struct SplitEvaluation {
    pub record: EpochRecord,
    pub cluster_ids: Vec<usize>,
    pub z_mean: Mat,
    pub responsibilities: Mat,
    /// per-example `H[q(y|x)]`
    pub entropies: Vec<f32>,
    pub centroids: LatentCentroids,
}

pub struct EpochSnapshot<'a> {
    pub epoch: usize,
    pub n_epochs: usize,
    pub training: &'a SplitEvaluation,
    pub validation: Option<&'a SplitEvaluation>,
}

/// External result-analysis hook, invoked on the thinning cadence.
pub trait EpochReporter {
    fn report(&self, snapshot: &EpochSnapshot) -> anyhow::Result<()>;
}

/// Orchestrates the epoch/minibatch loop around a built model: warm-up
/// weighting, checkpoint lifecycle, early stopping, learning curves,
/// and resume.
pub struct GmvaeTrainer<'a> {
    model: &'a Gmvae,
    varmap: &'a VarMap,
    base_log_directory: PathBuf,
}

impl<'a> GmvaeTrainer<'a> {
    pub fn new(model: &'a Gmvae, varmap: &'a VarMap, base_log_directory: PathBuf) -> Self {
        Self {
            model,
            varmap,
            base_log_directory,
        }
    }

    pub fn train(
        &self,
        training_set: &DataSet,
        validation_set: Option<&DataSet>,
        train_config: &TrainConfig,
        reporter: Option<&dyn EpochReporter>,
    ) -> anyhow::Result<TrainStatus> {
        let start_time = Instant::now();
        let config = self.model.config();
        let device = self.model.device();

        let run_id = match train_config.run_id.as_ref() {
            Some(id) => {
                check_run_id(id)?;
                id.clone()
            }
            None if train_config.new_run => generate_run_id(),
            None => "default".to_string(),
        };

        let model_name = config.model_name();
        let permanent = RunDirectory::new(&self.base_log_directory, &model_name, &run_id);

        if train_config.reset_training && permanent.exists() {
            info!("clearing log directory of run {}", run_id);
            clear_directory(permanent.root())?;
        }

        let permanent_epoch = permanent
            .checkpoint_meta(CheckpointKind::Latest)?
            .map(|m| m.epoch)
            .unwrap_or(0);

        // Stage in a temporary location when asked; an interrupted
        // staged run never touches the permanent directory.
        let (run_dir, staged) = match train_config.temporary_log_directory.as_ref() {
            Some(tmp_base) => {
                let staged_run = RunDirectory::new(tmp_base, &model_name, &run_id);
                let staged_epoch = staged_run
                    .checkpoint_meta(CheckpointKind::Latest)?
                    .map(|m| m.epoch)
                    .unwrap_or(0);
                if permanent.exists() && permanent_epoch >= staged_epoch {
                    info!("copying run {} into the staging directory", run_id);
                    clear_directory(staged_run.root())?;
                    copy_directory(permanent.root(), staged_run.root())?;
                }
                (staged_run, true)
            }
            None => (permanent.clone(), false),
        };

        let mut global_step = 0u64;
        let mut epoch_start = 0usize;
        if let Some(meta) = run_dir.load_checkpoint(self.varmap, CheckpointKind::Latest)? {
            info!(
                "restored model parameters of run {} at epoch {}",
                run_id, meta.epoch
            );
            epoch_start = meta.epoch;
            global_step = meta.global_step;
        }

        if epoch_start >= train_config.n_epochs {
            info!(
                "run {} already trained for {} epochs ({} requested)",
                run_id, epoch_start, train_config.n_epochs
            );
            return Ok(TrainStatus {
                outcome: TrainOutcome::AlreadyTrained,
                message: Some(format!(
                    "checkpoint at epoch {} meets the requested {} epochs",
                    epoch_start, train_config.n_epochs
                )),
                run_id,
                epochs_trained: (epoch_start, train_config.n_epochs),
                training_duration: Some(start_time.elapsed()),
                last_epoch_duration: None,
            });
        }

        for split in ["training", "validation"] {
            truncate_after(&run_dir.learning_curve_path(split), epoch_start)?;
        }

        // typed recovery of the early-stopping bookkeeping, once,
        // before the loop
        let mut es_state = if validation_set.is_some() {
            let records = load_records(&run_dir.learning_curve_path("validation"))?;
            recover_early_stopping_state(&records, config.early_stopping_rounds)
        } else {
            EarlyStoppingState::default()
        };
        if es_state.stopped_early {
            info!("early stopping already in effect for run {}", run_id);
        }

        let mut train_loader = InMemoryData::from_data_set(config, training_set)?;
        let valid_loader = match validation_set {
            Some(validation_set) => Some(InMemoryData::from_data_set(config, validation_set)?),
            None => None,
        };

        let train_label_ids = training_set.label_ids();
        let train_excluded = training_set.excluded_class_ids();

        let mut optimiser = AdamW::new_lr(
            self.varmap.all_vars(),
            train_config.learning_rate.into(),
        )?;

        let pb = ProgressBar::new((train_config.n_epochs - epoch_start) as u64);
        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        info!(
            "training run {} from epoch {} to {}",
            run_id, epoch_start, train_config.n_epochs
        );

        let mut last_epoch_duration = None;

        for epoch in epoch_start..train_config.n_epochs {
            let epoch_time = Instant::now();

            let warm_up = if config.n_warm_up_epochs > 0 {
                (epoch as f32 / config.n_warm_up_epochs as f32).min(1.)
            } else {
                1.
            };
            let weights = LossWeights {
                warm_up,
                kl_weight: config.kl_weight,
                clf_weight: config.clf_weight,
            };

            train_loader.shuffle_minibatch(train_config.batch_size)?;

            for b in 0..train_loader.num_minibatch() {
                let mb = train_loader.minibatch_shuffled(b, device)?;
                let forward = self
                    .model
                    .forward_t(&mb, &config.training_samples, true)?;
                let loss = compute_loss(
                    &forward,
                    &mb,
                    &config.training_samples,
                    &weights,
                    self.model.cluster_prior(),
                    config.proportion_of_free_nats,
                )?;

                if loss.lower_bound.is_nan() {
                    let message = format!(
                        "training loss became nan at step {} (epoch {})",
                        global_step + 1,
                        epoch + 1
                    );
                    info!("{}", message);
                    return Ok(TrainStatus {
                        outcome: TrainOutcome::FailedNaN,
                        message: Some(message),
                        run_id,
                        epochs_trained: (epoch_start, epoch),
                        training_duration: Some(start_time.elapsed()),
                        last_epoch_duration: Some(epoch_time.elapsed()),
                    });
                }

                let objective = loss.total_loss.neg()?;
                self.clipped_step(&mut optimiser, &objective)?;
                global_step += 1;

                if train_config.verbose {
                    info!(
                        "[{}] step {}: ELBO {:.5}, classification error {:.5}",
                        epoch + 1,
                        global_step,
                        loss.lower_bound,
                        loss.clf_error
                    );
                }
            }

            // full batched pass for monitoring, no gradient updates
            let mut train_eval = evaluate_split(
                self.model,
                &train_loader,
                train_config.batch_size,
                &config.training_samples,
                epoch,
            )?;
            if let Some(ids) = train_label_ids.as_ref() {
                let mapped =
                    map_cluster_ids_to_label_ids(ids, &train_eval.cluster_ids, &train_excluded);
                train_eval.record.accuracy = Some(accuracy(ids, &mapped, &train_excluded));
            }
            append_record(&run_dir.learning_curve_path("training"), &train_eval.record)?;

            let mut valid_eval = None;
            if let (Some(loader), Some(validation_set)) = (valid_loader.as_ref(), validation_set) {
                let mut ev = evaluate_split(
                    self.model,
                    loader,
                    train_config.batch_size,
                    &config.training_samples,
                    epoch,
                )?;
                if let Some(ids) = validation_set.label_ids() {
                    let excluded = validation_set.excluded_class_ids();
                    let mapped = map_cluster_ids_to_label_ids(&ids, &ev.cluster_ids, &excluded);
                    ev.record.accuracy = Some(accuracy(&ids, &mapped, &excluded));
                }
                append_record(&run_dir.learning_curve_path("validation"), &ev.record)?;
                valid_eval = Some(ev);
            }

            if train_config.verbose {
                log_epoch(epoch, warm_up, &train_eval, valid_eval.as_ref());
            }

            // early stopping first: a snapshot must capture the
            // parameters prior to this epoch's degradation
            if let Some(ev) = valid_eval.as_ref() {
                let was_stopped = es_state.stopped_early;
                match es_state.observe(
                    ev.record.lower_bound as f64,
                    config.early_stopping_rounds,
                ) {
                    EarlyStoppingAction::Snapshot => {
                        if run_dir.checkpoint_meta(CheckpointKind::Latest)?.is_some() {
                            info!("validation bound degraded; freezing previous parameters");
                            run_dir.copy_checkpoint(
                                CheckpointKind::Latest,
                                CheckpointKind::EarlyStopping,
                            )?;
                        }
                    }
                    EarlyStoppingAction::Discard => {
                        run_dir.remove_checkpoint(CheckpointKind::EarlyStopping)?;
                    }
                    EarlyStoppingAction::None => {}
                }
                if es_state.stopped_early && !was_stopped {
                    info!(
                        "early stopping in effect after {} epochs with no improvement",
                        config.early_stopping_rounds
                    );
                }
            }

            run_dir.save_checkpoint(
                self.varmap,
                CheckpointKind::Latest,
                CheckpointMeta {
                    epoch: epoch + 1,
                    global_step,
                },
            )?;

            if let Some(ev) = valid_eval.as_ref() {
                if es_state.observe_best(ev.record.lower_bound as f64) {
                    info!("best validation ELBO yet; keeping a best-model checkpoint");
                    run_dir.copy_checkpoint(CheckpointKind::Latest, CheckpointKind::Best)?;
                }
            }

            if should_analyse(epoch, train_config.n_epochs, train_config.analysis_interval) {
                if let Some(reporter) = reporter {
                    reporter.report(&EpochSnapshot {
                        epoch,
                        n_epochs: train_config.n_epochs,
                        training: &train_eval,
                        validation: valid_eval.as_ref(),
                    })?;
                }
            }

            last_epoch_duration = Some(epoch_time.elapsed());
            pb.inc(1);
        }

        pb.finish_and_clear();

        if staged {
            info!("moving staged run {} to its permanent location", run_id);
            replace_directory(run_dir.root(), permanent.root())?;
        }

        info!(
            "run {} trained for {} epochs ({:.1?})",
            run_id,
            train_config.n_epochs,
            start_time.elapsed()
        );

        Ok(TrainStatus {
            outcome: TrainOutcome::Completed,
            message: None,
            run_id,
            epochs_trained: (epoch_start, train_config.n_epochs),
            training_duration: Some(start_time.elapsed()),
            last_epoch_duration,
        })
    }

    /// One optimiser update with elementwise gradient clipping: count
    /// likelihoods produce long-tailed gradients, so every gradient is
    /// clamped to `[-1, 1]` between the backward pass and the step.
    fn clipped_step(&self, optimiser: &mut AdamW, objective: &Tensor) -> candle_core::Result<()> {
        let mut grads = objective.backward()?;
        for var in self.varmap.all_vars() {
            let clipped = match grads.get(var.as_tensor()) {
                Some(grad) => Some(grad.clamp(-1., 1.)?),
                None => None,
            };
            if let Some(grad) = clipped {
                grads.insert(var.as_tensor(), grad);
            }
        }
        optimiser.step(&grads)
    }
}

/// Reporting cadence: every epoch for the first 10, every 10th up to
/// 100, every 50th up to 1000, every 100th beyond, and always the
/// final epoch.
pub fn should_analyse(epoch: usize, n_epochs: usize, interval: Option<usize>) -> bool {
    if let Some(interval) = interval {
        return interval > 0 && epoch % interval == 0;
    }
    let nth = epoch + 1;
    epoch < 10
        || (epoch < 100 && nth % 10 == 0)
        || (epoch < 1000 && nth % 50 == 0)
        || (epoch >= 1000 && nth % 100 == 0)
        || nth == n_epochs
}

fn log_epoch(
    epoch: usize,
    warm_up: f32,
    training: &SplitEvaluation,
    validation: Option<&SplitEvaluation>,
) {
    if warm_up < 1. {
        info!("[{}] warm-up weight {:.2}", epoch + 1, warm_up);
    }
    let describe = |name: &str, ev: &SplitEvaluation| {
        let acc = ev
            .record
            .accuracy
            .map(|a| format!(", accuracy {:.3}", a))
            .unwrap_or_default();
        info!(
            "[{}] {}: ELBO {:.5}, ENRE {:.5}, KL_z {:.5}, KL_y {:.5}{}",
            epoch + 1,
            name,
            ev.record.lower_bound,
            ev.record.reconstruction_error,
            ev.record.kl_divergence_z,
            ev.record.kl_divergence_y,
            acc
        );
    };
    describe("training", training);
    if let Some(ev) = validation {
        describe("validation", ev);
    }
}

/// One batched inference pass over a split, accumulating monitoring
/// metrics, responsibilities, latent means and per-cluster centroid
/// summaries.
pub fn evaluate_split(
    model: &Gmvae,
    loader: &InMemoryData,
    batch_size: usize,
    samples: &SampleCounts,
    epoch: usize,
) -> anyhow::Result<SplitEvaluation> {
    let config = model.config();
    let device = model.device();
    let m = loader.num_data();
    let kk = config.n_clusters;
    let ll = config.n_latent;
    let n_batches = m.div_ceil(batch_size);
    anyhow::ensure!(n_batches > 0, "nothing to evaluate");

    let weights = LossWeights {
        warm_up: 1.,
        kl_weight: config.kl_weight,
        clf_weight: config.clf_weight,
    };

    let mut lower_bound = 0f64;
    let mut reconstruction_error = 0f64;
    let mut kl_z = 0f64;
    let mut kl_y = 0f64;
    let mut clf_error = 0f64;
    let mut kl_z_clusters = vec![0f64; kk];

    let mut posterior_probabilities = vec![0f64; kk];
    let mut posterior_means = vec![vec![0f64; ll]; kk];
    let mut posterior_variances = vec![vec![0f64; ll]; kk];
    let mut prior_means = vec![vec![0f64; ll]; kk];
    let mut prior_variances = vec![vec![0f64; ll]; kk];

    let mut cluster_ids = Vec::with_capacity(m);
    let mut entropies = Vec::with_capacity(m);
    let mut z_mean = Mat::zeros(m, ll);
    let mut responsibilities = Mat::zeros(m, kk);

    for b in 0..n_batches {
        let mb = loader.minibatch_ordered(b, batch_size, device)?;
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
        clf_error += loss.clf_error as f64;
        for (acc, v) in kl_z_clusters.iter_mut().zip(&loss.kl_divergence_z_clusters) {
            *acc += *v as f64;
        }

        let probs_rows = forward.y_posterior.probs()?.to_vec2::<f32>()?;
        let z_rows = forward.z_mean_nl.to_vec2::<f32>()?;
        let offset = b * batch_size;
        for (i, (probs, z)) in probs_rows.iter().zip(z_rows.iter()).enumerate() {
            for (k, &p) in probs.iter().enumerate() {
                responsibilities[(offset + i, k)] = p;
                posterior_probabilities[k] += p as f64 / probs_rows.len() as f64;
            }
            for (l, &z) in z.iter().enumerate() {
                z_mean[(offset + i, l)] = z;
            }
        }
        cluster_ids.extend(forward.y_posterior.arg_max()?);
        entropies.extend(forward.y_posterior.entropy_n()?.to_vec1::<f32>()?);

        for (k, cluster) in forward.clusters.iter().enumerate() {
            let post_mu = cluster.posterior.mu_nk.mean(0)?.to_vec1::<f32>()?;
            let post_var = cluster.posterior.variance()?.mean(0)?.to_vec1::<f32>()?;
            let prior_mu = cluster.prior.mu_nk.mean(0)?.to_vec1::<f32>()?;
            let prior_var = cluster.prior.variance()?.mean(0)?.to_vec1::<f32>()?;
            for l in 0..ll {
                posterior_means[k][l] += post_mu[l] as f64;
                posterior_variances[k][l] += post_var[l] as f64;
                prior_means[k][l] += prior_mu[l] as f64;
                prior_variances[k][l] += prior_var[l] as f64;
            }
        }
    }

    let norm = n_batches as f64;
    let centroids = LatentCentroids {
        prior_probabilities: model.cluster_prior().probs().to_vec(),
        posterior_probabilities: posterior_probabilities
            .iter()
            .map(|&p| (p / norm) as f32)
            .collect(),
        prior_means: normalise_rows(prior_means, norm),
        prior_variances: normalise_rows(prior_variances, norm),
        posterior_means: normalise_rows(posterior_means, norm),
        posterior_variances: normalise_rows(posterior_variances, norm),
    };

    let record = EpochRecord {
        epoch,
        lower_bound: (lower_bound / norm) as f32,
        reconstruction_error: (reconstruction_error / norm) as f32,
        kl_divergence_z: (kl_z / norm) as f32,
        kl_divergence_y: (kl_y / norm) as f32,
        clf_error: (clf_error / norm) as f32,
        accuracy: None,
        kl_divergence_z_clusters: kl_z_clusters.iter().map(|&v| (v / norm) as f32).collect(),
    };

    Ok(SplitEvaluation {
        record,
        cluster_ids,
        z_mean,
        responsibilities,
        entropies,
        centroids,
    })
}

fn normalise_rows(rows: Vec<Vec<f64>>, norm: f64) -> Vec<Vec<f32>> {
    rows.into_iter()
        .map(|row| row.into_iter().map(|v| (v / norm) as f32).collect())
        .collect()
}
