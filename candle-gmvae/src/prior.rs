#![allow(dead_code)]

use candle_core::{Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::aux_layers::ParamHead;
use crate::dist_registry::{LATENT_LOG_SIGMA, LATENT_MU};
use crate::encoder::GaussianParams;
use crate::model_config::GmvaeConfig;

/// `p(y)`: a uniform categorical over K clusters, or a fixed
/// categorical with externally supplied probabilities. Never learned.
pub struct ClusterPrior {
    probs: Vec<f32>,
    log_probs_1c: Tensor,
    uniform: bool,
}

impl ClusterPrior {
    pub fn new(config: &GmvaeConfig, device: &Device) -> Result<Self> {
        let (probs, uniform) = match config.prior_probabilities.as_ref() {
            Some(probs) => (probs.clone(), false),
            None => (
                vec![1. / config.n_clusters as f32; config.n_clusters],
                true,
            ),
        };
        let log_probs: Vec<f32> = probs.iter().map(|&p| p.ln()).collect();
        let log_probs_1c = Tensor::from_vec(log_probs, (1, config.n_clusters), device)?;
        Ok(Self {
            probs,
            log_probs_1c,
            uniform,
        })
    }

    pub fn is_uniform(&self) -> bool {
        self.uniform
    }

    pub fn probs(&self) -> &[f32] {
        &self.probs
    }

    pub fn log_probs_1c(&self) -> &Tensor {
        &self.log_probs_1c
    }

    /// `H[p(y)]`, closed form on the host.
    pub fn entropy(&self) -> f64 {
        if self.uniform {
            (self.probs.len() as f64).ln()
        } else {
            -self
                .probs
                .iter()
                .map(|&p| (p as f64) * (p as f64).ln())
                .sum::<f64>()
        }
    }
}

/// `p(z|y=k)`: a weakly learned diagonal Gaussian whose parameters are
/// linear in the one-hot cluster indicator, so each cluster owns a
/// learned centroid and scale while the mapping itself is shared.
pub struct LatentPrior {
    mu: ParamHead,
    log_sigma: ParamHead,
}

impl LatentPrior {
    pub fn new(config: &GmvaeConfig, vs: VarBuilder) -> Result<Self> {
        let mu = ParamHead::new(
            config.n_clusters,
            config.n_latent,
            &LATENT_MU,
            config.epsilon,
            vs.pp("z"),
        )?;
        let log_sigma = ParamHead::new(
            config.n_clusters,
            config.n_latent,
            &LATENT_LOG_SIGMA,
            config.epsilon,
            vs.pp("z"),
        )?;
        Ok(Self { mu, log_sigma })
    }

    pub fn forward(&self, y_nc: &Tensor) -> Result<GaussianParams> {
        Ok(GaussianParams {
            mu_nk: self.mu.forward(y_nc)?,
            log_sigma_nk: self.log_sigma.forward(y_nc)?,
        })
    }
}
