#![allow(dead_code)]

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;
use serde::{Deserialize, Serialize};

/// Activation applied to a raw parameter head before support clamping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamActivation {
    Identity,
    Sigmoid,
    /// softmax across features; used by rate parameters constrained to
    /// the simplex
    SoftmaxFeatures,
}

/// One named parameter of a reconstruction family with its numeric
/// support `[min, max]`.
#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub support: (f64, f64),
    pub activation: ParamActivation,
}

/// Closed set of supported reconstruction families. Resolved once at
/// model-build time; no per-batch dispatch on names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconstructionKind {
    Bernoulli,
    Poisson,
    ConstrainedPoisson,
    NegativeBinomial,
    ZeroInflatedPoisson,
    ZeroInflatedNegativeBinomial,
}

const INF: f64 = f64::INFINITY;

/// Parameter specs of the diagonal-Gaussian latent family shared by
/// the posterior `q(z|x,y)` and the prior `p(z|y)`.
pub const LATENT_MU: ParamSpec = ParamSpec {
    name: "mu",
    support: (-INF, INF),
    activation: ParamActivation::Identity,
};

pub const LATENT_LOG_SIGMA: ParamSpec = ParamSpec {
    name: "log_sigma",
    support: (-3., 3.),
    activation: ParamActivation::Identity,
};

impl ReconstructionKind {
    pub fn param_specs(&self) -> &'static [ParamSpec] {
        match self {
            ReconstructionKind::Bernoulli => &[ParamSpec {
                name: "p",
                support: (0., 1.),
                activation: ParamActivation::Sigmoid,
            }],
            ReconstructionKind::Poisson => &[ParamSpec {
                name: "log_lambda",
                support: (-10., 10.),
                activation: ParamActivation::Identity,
            }],
            ReconstructionKind::ConstrainedPoisson => &[ParamSpec {
                name: "lambda",
                support: (0., 1.),
                activation: ParamActivation::SoftmaxFeatures,
            }],
            ReconstructionKind::NegativeBinomial => &[
                ParamSpec {
                    name: "p",
                    support: (0., 1.),
                    activation: ParamActivation::Sigmoid,
                },
                ParamSpec {
                    name: "log_r",
                    support: (-10., 10.),
                    activation: ParamActivation::Identity,
                },
            ],
            ReconstructionKind::ZeroInflatedPoisson => &[
                ParamSpec {
                    name: "pi",
                    support: (0., 1.),
                    activation: ParamActivation::Sigmoid,
                },
                ParamSpec {
                    name: "log_lambda",
                    support: (-10., 10.),
                    activation: ParamActivation::Identity,
                },
            ],
            ReconstructionKind::ZeroInflatedNegativeBinomial => &[
                ParamSpec {
                    name: "pi",
                    support: (0., 1.),
                    activation: ParamActivation::Sigmoid,
                },
                ParamSpec {
                    name: "p",
                    support: (0., 1.),
                    activation: ParamActivation::Sigmoid,
                },
                ParamSpec {
                    name: "log_r",
                    support: (-10., 10.),
                    activation: ParamActivation::Identity,
                },
            ],
        }
    }

    pub fn normalised_name(&self) -> &'static str {
        match self {
            ReconstructionKind::Bernoulli => "bernoulli",
            ReconstructionKind::Poisson => "poisson",
            ReconstructionKind::ConstrainedPoisson => "constrained_poisson",
            ReconstructionKind::NegativeBinomial => "negative_binomial",
            ReconstructionKind::ZeroInflatedPoisson => "zero_inflated_poisson",
            ReconstructionKind::ZeroInflatedNegativeBinomial => "zero_inflated_negative_binomial",
        }
    }

    /// Whether observations should be binarised before scoring.
    pub fn binarised_target(&self) -> bool {
        matches!(self, ReconstructionKind::Bernoulli)
    }

    /// Whether the family scales a simplex rate by the per-example
    /// total count.
    pub fn needs_count_sum(&self) -> bool {
        matches!(self, ReconstructionKind::ConstrainedPoisson)
    }

    /// Assemble a distribution object from the transformed parameters,
    /// in `param_specs` order. `count_sum_m1` is required by families
    /// with `needs_count_sum`.
    pub fn build(
        &self,
        theta: &[Tensor],
        count_sum_m1: Option<&Tensor>,
    ) -> Result<Reconstruction> {
        match self {
            ReconstructionKind::Bernoulli => Ok(Reconstruction::Bernoulli {
                p: theta[0].clone(),
            }),
            ReconstructionKind::Poisson => Ok(Reconstruction::Poisson {
                log_lambda: theta[0].clone(),
            }),
            ReconstructionKind::ConstrainedPoisson => {
                let n_m1 = count_sum_m1.ok_or_else(|| {
                    candle_core::Error::Msg("constrained poisson needs count sums".to_string())
                })?;
                let rate = theta[0].broadcast_mul(n_m1)?;
                Ok(Reconstruction::ConstrainedPoisson { rate })
            }
            ReconstructionKind::NegativeBinomial => Ok(Reconstruction::NegativeBinomial {
                p: theta[0].clone(),
                log_r: theta[1].clone(),
            }),
            ReconstructionKind::ZeroInflatedPoisson => Ok(Reconstruction::ZeroInflatedPoisson {
                pi: theta[0].clone(),
                log_lambda: theta[1].clone(),
            }),
            ReconstructionKind::ZeroInflatedNegativeBinomial => {
                Ok(Reconstruction::ZeroInflatedNegativeBinomial {
                    pi: theta[0].clone(),
                    p: theta[1].clone(),
                    log_r: theta[2].clone(),
                })
            }
        }
    }
}

/// Stirling-like log-gamma that stays inside the tensor graph:
/// `-0.0810614667 - x - log(x) + (0.5 + x) * log(1 + x)`
pub fn approx_lgamma(x: &Tensor) -> Result<Tensor> {
    let term1 = (x.neg()? - 0.0810614667)?;
    let term2 = x.log()?.neg()?;
    let term3 = (x + 0.5)?.mul(&(x + 1.0)?.log()?)?;
    term1.add(&term2)?.add(&term3)
}

/// `log(x!)` for non-negative counts
pub fn log_factorial(x: &Tensor) -> Result<Tensor> {
    approx_lgamma(&(x + 1.0)?)
}

const TINY: f64 = 1e-12;

/// A reconstruction distribution parameterised per example and
/// feature. All tensors share one shape `(m, d)`; `log_prob` scores an
/// observation tensor of the same shape elementwise.
#[derive(Clone, Debug)]
pub enum Reconstruction {
    Bernoulli { p: Tensor },
    Poisson { log_lambda: Tensor },
    ConstrainedPoisson { rate: Tensor },
    NegativeBinomial { p: Tensor, log_r: Tensor },
    ZeroInflatedPoisson { pi: Tensor, log_lambda: Tensor },
    ZeroInflatedNegativeBinomial { pi: Tensor, p: Tensor, log_r: Tensor },
}

impl Reconstruction {
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Reconstruction::Bernoulli { p } => {
                let log_p = p.log()?;
                let log_1p = p.affine(-1., 1.)?.log()?;
                x.mul(&log_p)?.add(&x.affine(-1., 1.)?.mul(&log_1p)?)
            }
            Reconstruction::Poisson { log_lambda } => {
                let lambda = log_lambda.exp()?;
                x.mul(log_lambda)?.sub(&lambda)?.sub(&log_factorial(x)?)
            }
            Reconstruction::ConstrainedPoisson { rate } => {
                let log_rate = rate.clamp(TINY, INF)?.log()?;
                x.mul(&log_rate)?.sub(rate)?.sub(&log_factorial(x)?)
            }
            Reconstruction::NegativeBinomial { p, log_r } => {
                let r = log_r.exp()?;
                let log_1p = p.affine(-1., 1.)?.log()?;
                approx_lgamma(&x.add(&r)?)?
                    .sub(&approx_lgamma(&r)?)?
                    .sub(&log_factorial(x)?)?
                    .add(&r.mul(&log_1p)?)?
                    .add(&x.mul(&p.log()?)?)
            }
            Reconstruction::ZeroInflatedPoisson { pi, log_lambda } => {
                let base = Reconstruction::Poisson {
                    log_lambda: log_lambda.clone(),
                };
                let log_prob0 = log_lambda.exp()?.neg()?;
                zero_inflated_log_prob(pi, &base, &log_prob0, x)
            }
            Reconstruction::ZeroInflatedNegativeBinomial { pi, p, log_r } => {
                let base = Reconstruction::NegativeBinomial {
                    p: p.clone(),
                    log_r: log_r.clone(),
                };
                let log_prob0 = log_r.exp()?.mul(&p.affine(-1., 1.)?.log()?)?;
                zero_inflated_log_prob(pi, &base, &log_prob0, x)
            }
        }
    }

    pub fn mean(&self) -> Result<Tensor> {
        match self {
            Reconstruction::Bernoulli { p } => Ok(p.clone()),
            Reconstruction::Poisson { log_lambda } => log_lambda.exp(),
            Reconstruction::ConstrainedPoisson { rate } => Ok(rate.clone()),
            Reconstruction::NegativeBinomial { p, log_r } => {
                let r = log_r.exp()?;
                r.mul(p)?.div(&p.affine(-1., 1.)?)
            }
            Reconstruction::ZeroInflatedPoisson { pi, log_lambda } => {
                pi.affine(-1., 1.)?.mul(&log_lambda.exp()?)
            }
            Reconstruction::ZeroInflatedNegativeBinomial { pi, p, log_r } => {
                let base = Reconstruction::NegativeBinomial {
                    p: p.clone(),
                    log_r: log_r.clone(),
                };
                pi.affine(-1., 1.)?.mul(&base.mean()?)
            }
        }
    }

    pub fn variance(&self) -> Result<Tensor> {
        match self {
            Reconstruction::Bernoulli { p } => p.mul(&p.affine(-1., 1.)?),
            Reconstruction::Poisson { log_lambda } => log_lambda.exp(),
            Reconstruction::ConstrainedPoisson { rate } => Ok(rate.clone()),
            Reconstruction::NegativeBinomial { p, log_r } => {
                let r = log_r.exp()?;
                let one_minus_p = p.affine(-1., 1.)?;
                r.mul(p)?.div(&one_minus_p.sqr()?)
            }
            Reconstruction::ZeroInflatedPoisson { .. }
            | Reconstruction::ZeroInflatedNegativeBinomial { .. } => {
                let (pi, base) = self.zero_inflation_parts()?;
                let m = base.mean()?;
                let v = base.variance()?;
                let keep = pi.affine(-1., 1.)?;
                // V[x] = (1-pi)(v + m^2) - ((1-pi) m)^2
                let second = keep.mul(&v.add(&m.sqr()?)?)?;
                second.sub(&keep.mul(&m)?.sqr()?)
            }
        }
    }

    fn zero_inflation_parts(&self) -> Result<(Tensor, Reconstruction)> {
        match self {
            Reconstruction::ZeroInflatedPoisson { pi, log_lambda } => Ok((
                pi.clone(),
                Reconstruction::Poisson {
                    log_lambda: log_lambda.clone(),
                },
            )),
            Reconstruction::ZeroInflatedNegativeBinomial { pi, p, log_r } => Ok((
                pi.clone(),
                Reconstruction::NegativeBinomial {
                    p: p.clone(),
                    log_r: log_r.clone(),
                },
            )),
            _ => Err(candle_core::Error::Msg(
                "not a zero-inflated distribution".to_string(),
            )),
        }
    }
}

/// `log p(x)` of a zero-inflated distribution given the base family's
/// elementwise `log p(x)` at zero.
fn zero_inflated_log_prob(
    pi: &Tensor,
    base: &Reconstruction,
    log_prob0: &Tensor,
    x: &Tensor,
) -> Result<Tensor> {
    let keep = pi.affine(-1., 1.)?;
    let at_zero = pi
        .add(&keep.mul(&log_prob0.exp()?)?)?
        .clamp(TINY, 1.)?
        .log()?;
    let at_positive = keep.clamp(TINY, 1.)?.log()?.add(&base.log_prob(x)?)?;
    x.le(0.5)?.where_cond(&at_zero, &at_positive)
}

/// Reconstruction distribution optionally composed with a per-feature
/// categorical over count classes `0 .. k_max` where class `k_max`
/// hands over to the base distribution (the categorised composition).
#[derive(Clone, Debug)]
pub enum CountDistribution {
    Plain(Reconstruction),
    Categorized {
        base: Reconstruction,
        /// `(m, d, k_max + 1)` class logits
        class_logits: Tensor,
        k_max: usize,
    },
}

impl CountDistribution {
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            CountDistribution::Plain(dist) => dist.log_prob(x),
            CountDistribution::Categorized {
                base,
                class_logits,
                k_max,
            } => {
                let log_q = ops::log_softmax(class_logits, D::Minus1)?;
                let idx = x
                    .clamp(0., *k_max as f64)?
                    .to_dtype(DType::U32)?
                    .unsqueeze(D::Minus1)?;
                let log_class = log_q.gather(&idx, D::Minus1)?.squeeze(D::Minus1)?;
                let overflow = log_class.add(&base.log_prob(x)?)?;
                x.ge(*k_max as f64)?.where_cond(&overflow, &log_class)
            }
        }
    }

    pub fn mean(&self) -> Result<Tensor> {
        match self {
            CountDistribution::Plain(dist) => dist.mean(),
            CountDistribution::Categorized {
                base,
                class_logits,
                k_max,
            } => {
                let probs = ops::softmax(class_logits, D::Minus1)?;
                let class_mean = probs
                    .broadcast_mul(&class_values(class_logits, *k_max, 1)?)?
                    .sum(D::Minus1)?;
                let p_over = probs.narrow(D::Minus1, *k_max, 1)?.squeeze(D::Minus1)?;
                class_mean.add(&p_over.mul(&base.mean()?)?)
            }
        }
    }

    pub fn variance(&self) -> Result<Tensor> {
        match self {
            CountDistribution::Plain(dist) => dist.variance(),
            CountDistribution::Categorized {
                base,
                class_logits,
                k_max,
            } => {
                let probs = ops::softmax(class_logits, D::Minus1)?;
                let p_over = probs.narrow(D::Minus1, *k_max, 1)?.squeeze(D::Minus1)?;
                let class_second = probs
                    .broadcast_mul(&class_values(class_logits, *k_max, 2)?)?
                    .sum(D::Minus1)?;
                let base_mean = base.mean()?;
                let second = class_second
                    .add(&p_over.mul(&base.variance()?.add(&base_mean.sqr()?)?)?)?;
                second.sub(&self.mean()?.sqr()?)
            }
        }
    }
}

/// `[0, 1, .., k_max - 1, 0]^power` broadcastable against class
/// probabilities; the overflow class contributes through the base
/// distribution instead.
fn class_values(like: &Tensor, k_max: usize, power: u32) -> Result<Tensor> {
    let mut v: Vec<f32> = (0..k_max).map(|c| (c as f32).powi(power as i32)).collect();
    v.push(0.);
    Tensor::from_vec(v, k_max + 1, like.device())
}
