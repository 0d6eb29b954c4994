#![allow(dead_code)]

use candle_core::{Result, Tensor, D};
use candle_nn::{ops, Linear, Module, VarBuilder};

use crate::aux_layers::{DenseStack, ParamHead};
use crate::dist_registry::{LATENT_LOG_SIGMA, LATENT_MU};
use crate::model_config::GmvaeConfig;

const LOG_2PI: f64 = 1.8378770664093453;

/// Parameters of a categorical distribution over the K clusters,
/// one row per example.
pub struct CategoricalParams {
    pub logits_nc: Tensor,
}

impl CategoricalParams {
    pub fn probs(&self) -> Result<Tensor> {
        ops::softmax(&self.logits_nc, D::Minus1)
    }

    pub fn log_probs(&self) -> Result<Tensor> {
        ops::log_softmax(&self.logits_nc, D::Minus1)
    }

    /// `H[q(y|x)]` per example
    pub fn entropy_n(&self) -> Result<Tensor> {
        let log_p = self.log_probs()?;
        log_p.exp()?.mul(&log_p)?.sum(D::Minus1)?.neg()
    }

    /// Categorical KL divergence to a fixed prior given as
    /// log-probabilities of shape `(1, c)`.
    pub fn kl_to_n(&self, prior_log_probs_1c: &Tensor) -> Result<Tensor> {
        let log_q = self.log_probs()?;
        let q = log_q.exp()?;
        q.mul(&log_q.broadcast_sub(prior_log_probs_1c)?)?
            .sum(D::Minus1)
    }

    /// Hard cluster assignment per example.
    pub fn arg_max(&self) -> Result<Vec<usize>> {
        let ids = self.logits_nc.argmax(D::Minus1)?.to_vec1::<u32>()?;
        Ok(ids.into_iter().map(|i| i as usize).collect())
    }
}

/// Parameters of a diagonal Gaussian, one row per example.
pub struct GaussianParams {
    pub mu_nk: Tensor,
    pub log_sigma_nk: Tensor,
}

impl GaussianParams {
    pub fn sigma(&self) -> Result<Tensor> {
        self.log_sigma_nk.exp()
    }

    pub fn variance(&self) -> Result<Tensor> {
        (&self.log_sigma_nk * 2.)?.exp()
    }

    /// Reparameterised draws, `(n_samples, n, k)`.
    pub fn sample(&self, n_samples: usize) -> Result<Tensor> {
        let (n, k) = self.mu_nk.dims2()?;
        let eps = Tensor::randn(0f32, 1f32, (n_samples, n, k), self.mu_nk.device())?;
        eps.broadcast_mul(&self.sigma()?)?
            .broadcast_add(&self.mu_nk)
    }

    /// `log N(z; mu, sigma)` summed over the latent dimensions;
    /// `z_snk` is `(s, n, k)`, the result `(s, n)`.
    pub fn log_prob(&self, z_snk: &Tensor) -> Result<Tensor> {
        let standardised = z_snk
            .broadcast_sub(&self.mu_nk)?
            .broadcast_div(&self.sigma()?)?;
        let log_density = (standardised.sqr()?
            .broadcast_add(&(&self.log_sigma_nk * 2.)?)?
            + LOG_2PI)?
            * (-0.5);
        log_density?.sum(D::Minus1)
    }
}

/// Encoder for `q(y|x)`: categorical logits over K clusters from a
/// dense stack on the raw features.
pub struct ClusterPosterior {
    fc: DenseStack,
    logits: Linear,
    n_clusters: usize,
}

impl ClusterPosterior {
    pub fn new(config: &GmvaeConfig, vs: VarBuilder) -> Result<Self> {
        let fc = DenseStack::new(
            config.n_features,
            &config.hidden_sizes,
            config.batch_normalisation,
            config.dropout,
            vs.pp("fc"),
        )?;
        let logits = candle_nn::linear(fc.out_dim(), config.n_clusters, vs.pp("logits"))?;
        Ok(Self {
            fc,
            logits,
            n_clusters: config.n_clusters,
        })
    }

    pub fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<CategoricalParams> {
        let h = self.fc.forward_t(x_nd, train)?;
        Ok(CategoricalParams {
            logits_nc: self.logits.forward(&h)?,
        })
    }
}

/// Encoder for `q(z|x, y=k)`: one parametric function over the
/// concatenation of features and a one-hot cluster indicator. The same
/// weights serve all K clusters; only the indicator changes.
pub struct LatentPosterior {
    fc: DenseStack,
    mu: ParamHead,
    log_sigma: ParamHead,
}

impl LatentPosterior {
    pub fn new(config: &GmvaeConfig, vs: VarBuilder) -> Result<Self> {
        let fc = DenseStack::new(
            config.n_features + config.n_clusters,
            &config.hidden_sizes,
            config.batch_normalisation,
            config.dropout,
            vs.pp("fc"),
        )?;
        let mu = ParamHead::new(
            fc.out_dim(),
            config.n_latent,
            &LATENT_MU,
            config.epsilon,
            vs.pp("z"),
        )?;
        let log_sigma = ParamHead::new(
            fc.out_dim(),
            config.n_latent,
            &LATENT_LOG_SIGMA,
            config.epsilon,
            vs.pp("z"),
        )?;
        Ok(Self { fc, mu, log_sigma })
    }

    pub fn forward_t(&self, x_nd: &Tensor, y_nc: &Tensor, train: bool) -> Result<GaussianParams> {
        let xy = Tensor::cat(&[x_nd, y_nc], D::Minus1)?;
        let h = self.fc.forward_t(&xy, train)?;
        Ok(GaussianParams {
            mu_nk: self.mu.forward(&h)?,
            log_sigma_nk: self.log_sigma.forward(&h)?,
        })
    }
}

/// One-hot indicator rows for cluster `k`, `(n, n_clusters)`.
pub fn one_hot_rows(k: usize, n_clusters: usize, n: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut hot = vec![0f32; n_clusters];
    hot[k] = 1.;
    Tensor::from_vec(hot, (1, n_clusters), device)?
        .expand((n, n_clusters))?
        .contiguous()
}
