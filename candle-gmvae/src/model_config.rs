#![allow(dead_code)]

use crate::dist_registry::ReconstructionKind;

/// Importance-weighting and Monte Carlo sample counts for one phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleCounts {
    pub importance: usize,
    pub monte_carlo: usize,
}

impl SampleCounts {
    pub fn total(&self) -> usize {
        self.importance * self.monte_carlo
    }
}

impl Default for SampleCounts {
    fn default() -> Self {
        Self {
            importance: 1,
            monte_carlo: 1,
        }
    }
}

/// Immutable model configuration. Every component constructor takes a
/// reference to this value object; nothing reads configuration from
/// anywhere else.
#[derive(Clone, Debug)]
pub struct GmvaeConfig {
    pub n_features: usize,
    pub n_latent: usize,
    pub hidden_sizes: Vec<usize>,
    pub n_clusters: usize,
    pub n_classes: usize,
    pub reconstruction: ReconstructionKind,
    /// `k_max`: counts below this are modelled by an auxiliary
    /// per-feature categorical, the rest by the overflow class
    pub n_count_classes: Option<usize>,
    pub count_sum_feature: bool,
    /// fixed (not learned) prior probabilities for `p(y)`; uniform when
    /// absent
    pub prior_probabilities: Option<Vec<f32>>,
    pub training_samples: SampleCounts,
    pub evaluation_samples: SampleCounts,
    pub proportion_of_free_nats: f32,
    pub n_warm_up_epochs: usize,
    pub kl_weight: f32,
    pub clf_weight: f32,
    pub n_labeled_examples: usize,
    pub early_stopping_rounds: usize,
    pub batch_normalisation: bool,
    pub dropout: Option<f32>,
    pub epsilon: f64,
}

impl GmvaeConfig {
    pub fn new(
        n_features: usize,
        n_latent: usize,
        hidden_sizes: Vec<usize>,
        n_clusters: usize,
        reconstruction: ReconstructionKind,
    ) -> Self {
        Self {
            n_features,
            n_latent,
            hidden_sizes,
            n_clusters,
            n_classes: n_clusters,
            reconstruction,
            n_count_classes: None,
            count_sum_feature: false,
            prior_probabilities: None,
            training_samples: SampleCounts::default(),
            evaluation_samples: SampleCounts::default(),
            proportion_of_free_nats: 0.8,
            n_warm_up_epochs: 0,
            kl_weight: 1.,
            clf_weight: 1.,
            n_labeled_examples: 0,
            early_stopping_rounds: 10,
            batch_normalisation: true,
            dropout: None,
            epsilon: 1e-6,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.n_features > 0, "need at least one feature");
        anyhow::ensure!(self.n_latent > 0, "need at least one latent dimension");
        anyhow::ensure!(self.n_clusters >= 1, "need K >= 1 mixture components");
        anyhow::ensure!(
            !self.hidden_sizes.is_empty(),
            "need at least one hidden layer"
        );
        for counts in [&self.training_samples, &self.evaluation_samples] {
            anyhow::ensure!(
                counts.importance >= 1 && counts.monte_carlo >= 1,
                "sample counts must be >= 1"
            );
        }
        if let Some(probs) = self.prior_probabilities.as_ref() {
            anyhow::ensure!(
                probs.len() == self.n_clusters,
                "{} prior probabilities for K = {}",
                probs.len(),
                self.n_clusters
            );
            let total: f32 = probs.iter().sum();
            anyhow::ensure!(
                (total - 1.).abs() < 1e-4 && probs.iter().all(|&p| p > 0.),
                "prior probabilities must be positive and sum to one"
            );
        }
        if let Some(p) = self.dropout {
            anyhow::ensure!((0. ..1.).contains(&p), "dropout must be in [0, 1)");
        }
        if self.n_labeled_examples > 0 {
            anyhow::ensure!(
                self.n_classes == self.n_clusters,
                "the supervised term needs one class per cluster ({} classes, K = {})",
                self.n_classes,
                self.n_clusters
            );
        }
        anyhow::ensure!(
            (0. ..=1.).contains(&self.proportion_of_free_nats),
            "free-nat proportion must be in [0, 1]"
        );
        Ok(())
    }

    /// Deterministic model name: identical configurations resolve to
    /// the same run path, differing configurations never collide.
    pub fn model_name(&self) -> String {
        let mut latent_parts = vec!["gaussian_mixture".to_string()];
        latent_parts.push(format!("c_{}", self.n_clusters));
        if self.prior_probabilities.is_some() {
            latent_parts.push("p_fixed".to_string());
        }

        let mut parts = vec![self.reconstruction.normalised_name().to_string()];
        if let Some(k_max) = self.n_count_classes {
            parts.push(format!("k_{}", k_max));
        }
        if self.count_sum_feature {
            parts.push("sum".to_string());
        }
        parts.push(format!("l_{}", self.n_latent));
        parts.push(format!(
            "h_{}",
            self.hidden_sizes
                .iter()
                .map(|h| h.to_string())
                .collect::<Vec<_>>()
                .join("_")
        ));
        parts.push(format!("mc_{}", self.training_samples.monte_carlo));
        parts.push(format!("iw_{}", self.training_samples.importance));
        if self.batch_normalisation {
            parts.push("bn".to_string());
        }
        if let Some(p) = self.dropout {
            parts.push(format!("dropout_{}", p));
        }
        if self.kl_weight != 1. {
            parts.push(format!("klw_{}", self.kl_weight));
        }
        if self.clf_weight != 1. {
            parts.push(format!("clfw_{}", self.clf_weight));
        }
        if self.n_labeled_examples > 0 {
            parts.push(format!("nl_{}", self.n_labeled_examples));
        }
        if self.n_warm_up_epochs > 0 {
            parts.push(format!("wu_{}", self.n_warm_up_epochs));
        }
        if self.proportion_of_free_nats > 0. {
            parts.push(format!("fn_{}", self.proportion_of_free_nats));
        }

        format!("gmvae/{}/{}", latent_parts.join("-"), parts.join("-"))
    }

    /// Decoder input width: the latent sample, optionally concatenated
    /// with the normalised count-sum feature.
    pub fn decoder_input_size(&self) -> usize {
        self.n_latent + usize::from(self.count_sum_feature)
    }
}
