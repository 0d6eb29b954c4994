#![allow(dead_code)]

use candle_core::{Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::data_loader::MinibatchData;
use crate::decoder::CountDecoder;
use crate::dist_registry::CountDistribution;
use crate::encoder::{one_hot_rows, CategoricalParams, ClusterPosterior, GaussianParams, LatentPosterior};
use crate::model_config::{GmvaeConfig, SampleCounts};
use crate::prior::{ClusterPrior, LatentPrior};

/// Everything the loss and evaluation engines need about one mixture
/// component: the same shared-weight sub-networks evaluated with this
/// component's one-hot indicator.
pub struct ClusterForward {
    /// `q(z|x, y=k)`
    pub posterior: GaussianParams,
    /// `p(z|y=k)`
    pub prior: GaussianParams,
    /// latent draws `(s, n, l)` with `s = importance * monte_carlo`
    pub z_snl: Tensor,
    /// `p(x|z_k)` parameterised over `(s * n, d)`
    pub px: CountDistribution,
}

pub struct GmvaeForward {
    /// `q(y|x)`
    pub y_posterior: CategoricalParams,
    pub clusters: Vec<ClusterForward>,
    /// responsibility-weighted posterior mean embedding `(n, l)`
    pub z_mean_nl: Tensor,
}

/// The assembled model graph. Topology is fixed at construction; the
/// K cluster branches share every weight and differ only in the
/// conditioning one-hot input.
pub struct Gmvae {
    config: GmvaeConfig,
    device: Device,
    q_y: ClusterPosterior,
    q_z: LatentPosterior,
    p_y: ClusterPrior,
    p_z: LatentPrior,
    decoder: CountDecoder,
}

impl Gmvae {
    pub fn new(config: &GmvaeConfig, vs: VarBuilder, device: &Device) -> anyhow::Result<Self> {
        config.validate()?;

        let q_y = ClusterPosterior::new(config, vs.pp("q.y"))?;
        let q_z = LatentPosterior::new(config, vs.pp("q.z"))?;
        let p_y = ClusterPrior::new(config, device)?;
        let p_z = LatentPrior::new(config, vs.pp("p.z"))?;
        let decoder = CountDecoder::new(config, vs.pp("p.x"))?;

        Ok(Self {
            config: config.clone(),
            device: device.clone(),
            q_y,
            q_z,
            p_y,
            p_z,
            decoder,
        })
    }

    pub fn config(&self) -> &GmvaeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn cluster_prior(&self) -> &ClusterPrior {
        &self.p_y
    }

    /// One pass through the inference and generative networks for a
    /// minibatch: `q(y|x)`, then for every cluster `q(z|x,y=k)`,
    /// `p(z|y=k)`, latent draws, and the decoded `p(x|z_k)`.
    pub fn forward_t(
        &self,
        mb: &MinibatchData,
        samples: &SampleCounts,
        train: bool,
    ) -> Result<GmvaeForward> {
        let x_nd = &mb.input;
        let (n, _) = x_nd.dims2()?;
        let s = samples.total();
        let kk = self.config.n_clusters;

        let y_posterior = self.q_y.forward_t(x_nd, train)?;
        let pi_nc = y_posterior.probs()?;

        let mut clusters = Vec::with_capacity(kk);
        let mut z_mean_nl = Tensor::zeros((n, self.config.n_latent), x_nd.dtype(), &self.device)?;

        for k in 0..kk {
            let y_nc = one_hot_rows(k, kk, n, &self.device)?;

            let posterior = self.q_z.forward_t(x_nd, &y_nc, train)?;
            let prior = self.p_z.forward(&y_nc)?;
            let z_snl = posterior.sample(s)?;

            let px = self.decoder.forward_t(
                &z_snl,
                mb.count_sum.as_ref(),
                mb.normalised_count_sum.as_ref(),
                train,
            )?;

            let pi_k_n1 = pi_nc.narrow(1, k, 1)?;
            z_mean_nl = z_mean_nl.add(&posterior.mu_nk.broadcast_mul(&pi_k_n1)?)?;

            clusters.push(ClusterForward {
                posterior,
                prior,
                z_snl,
                px,
            });
        }

        Ok(GmvaeForward {
            y_posterior,
            clusters,
            z_mean_nl,
        })
    }
}
