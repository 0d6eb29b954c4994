#![allow(dead_code)]

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

use crate::data_loader::MinibatchData;
use crate::gmvae::GmvaeForward;
use crate::model_config::SampleCounts;
use crate::prior::ClusterPrior;

/// Objective weights that vary over training; the monitored bound
/// never sees them.
#[derive(Clone, Copy, Debug)]
pub struct LossWeights {
    pub warm_up: f32,
    pub kl_weight: f32,
    pub clf_weight: f32,
}

/// One minibatch worth of objective values. `total_loss` stays in the
/// graph for the backward pass; everything else is extracted for
/// monitoring.
pub struct LossRecord {
    pub total_loss: Tensor,
    /// `ELBO = ENRE - (KL_z + KL_y)`, unweighted, for early stopping
    pub lower_bound: f32,
    /// expected negative reconstruction error `ENRE`
    pub reconstruction_error: f32,
    pub kl_divergence_z: f32,
    /// unclipped; the free-nats floor only applies inside the objective
    pub kl_divergence_y: f32,
    pub clf_error: f32,
    /// importance-weighted marginal-likelihood estimate
    pub iw_lower_bound: f32,
    pub kl_divergence_z_clusters: Vec<f32>,
}

/// Numerically stable `log( mean( exp(t) ) )` along `dim`.
pub fn log_mean_exp(t: &Tensor, dim: usize) -> Result<Tensor> {
    let m = t.max_keepdim(dim)?;
    let centred = t.broadcast_sub(&m)?;
    centred
        .exp()?
        .mean_keepdim(dim)?
        .log()?
        .add(&m)?
        .squeeze(dim)
}

/// Weighted mean over examples: `sum(w * x) / #nonzero(w)`, zero when
/// nothing is weighted; plain mean when no weights are given.
pub fn masked_mean(x_n: &Tensor, weights_n: Option<&Tensor>) -> Result<Tensor> {
    match weights_n {
        Some(w_n) => {
            let denom = w_n.sum_all()?.to_scalar::<f32>()? as f64;
            if denom > 0. {
                x_n.mul(w_n)?.sum_all()? / denom
            } else {
                Tensor::zeros((), x_n.dtype(), x_n.device())
            }
        }
        None => x_n.mean_all(),
    }
}

/// Assemble the importance-weighted variational objective with the
/// semi-supervised classification term from one forward pass.
pub fn compute_loss(
    forward: &GmvaeForward,
    mb: &MinibatchData,
    samples: &SampleCounts,
    weights: &LossWeights,
    prior: &ClusterPrior,
    proportion_of_free_nats: f32,
) -> Result<LossRecord> {
    let rr = samples.importance;
    let ll = samples.monte_carlo;
    let s = rr * ll;
    let (n, d) = mb.target.dims2()?;
    let device = mb.target.device();

    let pi_nc = forward.y_posterior.probs()?;

    // observations tiled per latent draw: (s * n, d)
    let t_md = mb
        .target
        .unsqueeze(0)?
        .expand((s, n, d))?
        .contiguous()?
        .reshape((s * n, d))?;

    let mut kl_z_n = Tensor::zeros(n, DType::F32, device)?;
    let mut enre_n = kl_z_n.clone();
    let mut iw_n = kl_z_n.clone();
    let mut kl_z_clusters = Vec::with_capacity(forward.clusters.len());

    let warm_up = weights.warm_up as f64;

    for (k, cluster) in forward.clusters.iter().enumerate() {
        let log_q_sn = cluster.posterior.log_prob(&cluster.z_snl)?;
        let log_p_sn = cluster.prior.log_prob(&cluster.z_snl)?;
        // (r, l, n)
        let kl_rln = log_q_sn.sub(&log_p_sn)?.reshape((rr, ll, n))?;

        let log_px_rln = cluster
            .px
            .log_prob(&t_md)?
            .sum(D::Minus1)?
            .reshape((rr, ll, n))?;

        let pi_k_n = pi_nc.narrow(1, k, 1)?.squeeze(1)?;

        let kl_k_n = kl_rln.mean(0)?.mean(0)?;
        kl_z_n = kl_z_n.add(&kl_k_n.mul(&pi_k_n)?)?;
        kl_z_clusters.push(kl_k_n.mul(&pi_k_n)?.mean_all()?.to_scalar::<f32>()?);

        enre_n = enre_n.add(&log_px_rln.mean(0)?.mean(0)?.mul(&pi_k_n)?)?;

        // log-mean-exp over the importance axis, plain mean over the
        // Monte Carlo axis
        let iw_arg = log_px_rln.sub(&(kl_rln * warm_up)?)?;
        let iw_k_n = log_mean_exp(&iw_arg, 0)?.mean(0)?;
        iw_n = iw_n.add(&iw_k_n.mul(&pi_k_n)?)?;
    }

    let kl_y_n = if prior.is_uniform() {
        forward
            .y_posterior
            .entropy_n()?
            .affine(-1., prior.entropy())?
    } else {
        forward.y_posterior.kl_to_n(prior.log_probs_1c())?
    };

    // labeled examples are driven by the classification term instead
    let unlabeled_n = match mb.clf_mask.as_ref() {
        Some(mask_n) => Some(mask_n.affine(-1., 1.)?),
        None => None,
    };

    let enre = masked_mean(&enre_n, unlabeled_n.as_ref())?;
    let kl_z = masked_mean(&kl_z_n, unlabeled_n.as_ref())?;
    let kl_y = masked_mean(&kl_y_n, unlabeled_n.as_ref())?;
    let iw = masked_mean(&iw_n, unlabeled_n.as_ref())?;

    let free_nats = (proportion_of_free_nats as f64) * prior.entropy();
    let kl_y_floored = if proportion_of_free_nats > 0. {
        kl_y.maximum(free_nats)?
    } else {
        kl_y.clone()
    };

    let (clf_error, alpha) = match (mb.labels.as_ref(), mb.clf_mask.as_ref()) {
        (Some(labels_nc), Some(mask_n)) => {
            let log_q_nc = ops::log_softmax(&forward.y_posterior.logits_nc, D::Minus1)?;
            let ce_n = labels_nc.mul(&log_q_nc)?.sum(D::Minus1)?.neg()?;
            let clf = masked_mean(&ce_n, Some(mask_n))?;
            let n_labeled = mask_n.sum_all()?.to_scalar::<f32>()? as f64;
            let alpha = if n_labeled > 0. {
                weights.clf_weight as f64 * (2. + 2. * n_labeled)
            } else {
                0.
            };
            (clf, alpha)
        }
        _ => (Tensor::zeros((), DType::F32, device)?, 0.),
    };

    let total_kl_weight = warm_up * weights.kl_weight as f64;
    let elbo_weighted = enre.sub(&(kl_z.add(&kl_y_floored)? * total_kl_weight)?)?;
    let total_loss = elbo_weighted.sub(&(clf_error.clone() * alpha)?)?;

    let lower_bound = enre.sub(&kl_z.add(&kl_y)?)?.to_scalar::<f32>()?;

    Ok(LossRecord {
        total_loss,
        lower_bound,
        reconstruction_error: enre.to_scalar::<f32>()?,
        kl_divergence_z: kl_z.to_scalar::<f32>()?,
        kl_divergence_y: kl_y.to_scalar::<f32>()?,
        clf_error: clf_error.to_scalar::<f32>()?,
        iw_lower_bound: iw.to_scalar::<f32>()?,
        kl_divergence_z_clusters: kl_z_clusters,
    })
}
