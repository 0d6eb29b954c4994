#![allow(dead_code)]

use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::aux_layers::{DenseStack, ParamHead};
use crate::dist_registry::{CountDistribution, ReconstructionKind};
use crate::model_config::GmvaeConfig;

/// Decoder for `p(x|z)`: a dense stack over the latent sample
/// (optionally concatenated with the normalised count-sum feature)
/// feeding one clamped head per reconstruction parameter, plus the
/// optional per-feature count-class logits. Shared across clusters;
/// only the latent sample differs.
pub struct CountDecoder {
    fc: DenseStack,
    heads: Vec<ParamHead>,
    class_logits: Option<Linear>,
    kind: ReconstructionKind,
    n_features: usize,
    n_count_classes: Option<usize>,
    count_sum_feature: bool,
}

impl CountDecoder {
    pub fn new(config: &GmvaeConfig, vs: VarBuilder) -> Result<Self> {
        // hidden sizes mirrored relative to the encoder
        let widths: Vec<usize> = config.hidden_sizes.iter().rev().copied().collect();
        let fc = DenseStack::new(
            config.decoder_input_size(),
            &widths,
            config.batch_normalisation,
            config.dropout,
            vs.pp("fc"),
        )?;

        let heads = config
            .reconstruction
            .param_specs()
            .iter()
            .map(|spec| {
                ParamHead::new(
                    fc.out_dim(),
                    config.n_features,
                    spec,
                    config.epsilon,
                    vs.pp("x"),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let class_logits = match config.n_count_classes {
            Some(k_max) => Some(candle_nn::linear(
                fc.out_dim(),
                config.n_features * (k_max + 1),
                vs.pp("x.classes"),
            )?),
            None => None,
        };

        Ok(Self {
            fc,
            heads,
            class_logits,
            kind: config.reconstruction,
            n_features: config.n_features,
            n_count_classes: config.n_count_classes,
            count_sum_feature: config.count_sum_feature,
        })
    }

    /// Decode `(s, n, l)` latent samples into a reconstruction
    /// distribution parameterised over `(s * n, d)`.
    pub fn forward_t(
        &self,
        z_snl: &Tensor,
        count_sum_n1: Option<&Tensor>,
        normalised_count_sum_n1: Option<&Tensor>,
        train: bool,
    ) -> Result<CountDistribution> {
        let (s, n, l) = z_snl.dims3()?;
        let mut h = z_snl.reshape((s * n, l))?;

        if self.count_sum_feature {
            let n_feature = normalised_count_sum_n1.ok_or_else(|| {
                candle_core::Error::Msg("decoder expects a normalised count-sum column".to_string())
            })?;
            h = Tensor::cat(&[&h, &replicate_per_sample(n_feature, s)?], D::Minus1)?;
        }

        let h = self.fc.forward_t(&h, train)?;

        let theta = self
            .heads
            .iter()
            .map(|head| head.forward(&h))
            .collect::<Result<Vec<_>>>()?;

        let count_rep = match count_sum_n1 {
            Some(n_m1) => Some(replicate_per_sample(n_m1, s)?),
            None => None,
        };
        let base = self.kind.build(&theta, count_rep.as_ref())?;

        match self.n_count_classes {
            Some(k_max) => {
                let logits = self
                    .class_logits
                    .as_ref()
                    .ok_or_else(|| {
                        candle_core::Error::Msg("count-class head missing".to_string())
                    })?
                    .forward(&h)?
                    .reshape((s * n, self.n_features, k_max + 1))?;
                Ok(CountDistribution::Categorized {
                    base,
                    class_logits: logits,
                    k_max,
                })
            }
            None => Ok(CountDistribution::Plain(base)),
        }
    }

    pub fn dim_obs(&self) -> usize {
        self.n_features
    }
}

/// Tile a per-example column `(n, 1)` across the sample axis into
/// `(s * n, 1)`, matching a flattened `(s, n, .)` layout.
fn replicate_per_sample(col_n1: &Tensor, s: usize) -> Result<Tensor> {
    let (n, w) = col_n1.dims2()?;
    col_n1
        .unsqueeze(0)?
        .expand((s, n, w))?
        .contiguous()?
        .reshape((s * n, w))
}
