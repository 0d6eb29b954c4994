#![allow(dead_code)]

use candle_core::{Result, Tensor, D};
use candle_nn::{ops, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};

use crate::dist_registry::{ParamActivation, ParamSpec};

fn batch_norm_config() -> candle_nn::BatchNormConfig {
    candle_nn::BatchNormConfig {
        eps: 1e-4,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    }
}

struct DenseLayer {
    linear: Linear,
    bn: Option<BatchNorm>,
    dropout: Option<Dropout>,
}

/// A stack of fully connected layers: linear, optional batch
/// normalisation, ReLU, optional dropout, evaluated with an explicit
/// `train` flag so the moving statistics only update during training.
pub struct DenseStack {
    layers: Vec<DenseLayer>,
    out_dim: usize,
}

impl DenseStack {
    /// Creates variables `fc.{i}.weight`, `fc.{i}.bias` and, with batch
    /// normalisation, `fc.{i}.bn.*` under the given builder scope.
    pub fn new(
        input_dim: usize,
        widths: &[usize],
        batch_normalisation: bool,
        dropout: Option<f32>,
        vs: VarBuilder,
    ) -> Result<Self> {
        debug_assert!(!widths.is_empty());

        let mut layers = Vec::with_capacity(widths.len());
        let mut prev_dim = input_dim;
        for (j, &next_dim) in widths.iter().enumerate() {
            let name = format!("fc.{}", j);
            let linear = candle_nn::linear(prev_dim, next_dim, vs.pp(&name))?;
            let bn = if batch_normalisation {
                Some(candle_nn::batch_norm(
                    next_dim,
                    batch_norm_config(),
                    vs.pp(format!("{}.bn", name)),
                )?)
            } else {
                None
            };
            layers.push(DenseLayer {
                linear,
                bn,
                dropout: dropout.map(Dropout::new),
            });
            prev_dim = next_dim;
        }

        Ok(Self {
            layers,
            out_dim: prev_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in self.layers.iter() {
            h = layer.linear.forward(&h)?;
            if let Some(bn) = layer.bn.as_ref() {
                h = bn.forward_t(&h, train)?;
            }
            h = h.relu()?;
            if let Some(dropout) = layer.dropout.as_ref() {
                h = dropout.forward_t(&h, train)?;
            }
        }
        Ok(h)
    }
}

/// A linear head producing one distribution parameter: applies the
/// declared activation, then clamps into the support shrunk by an
/// epsilon margin so downstream densities never see a boundary value.
pub struct ParamHead {
    linear: Linear,
    activation: ParamActivation,
    lo: f64,
    hi: f64,
}

impl ParamHead {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        spec: &ParamSpec,
        epsilon: f64,
        vs: VarBuilder,
    ) -> Result<Self> {
        let linear = candle_nn::linear(in_dim, out_dim, vs.pp(spec.name))?;
        let (min, max) = spec.support;
        Ok(Self {
            linear,
            activation: spec.activation,
            lo: min + epsilon,
            hi: max - epsilon,
        })
    }

    pub fn forward(&self, h: &Tensor) -> Result<Tensor> {
        let raw = self.linear.forward(h)?;
        let activated = match self.activation {
            ParamActivation::Identity => raw,
            ParamActivation::Sigmoid => ops::sigmoid(&raw)?,
            ParamActivation::SoftmaxFeatures => ops::softmax(&raw, D::Minus1)?,
        };
        activated.clamp(self.lo, self.hi)
    }
}
