#![allow(dead_code)]

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Gamma, Poisson};

use crate::data_set::*;

pub struct SimArgs {
    pub n_examples: usize,
    pub n_features: usize,
    pub n_clusters: usize,
    /// average total count per example
    pub depth: f32,
    /// ratio between within-cluster and background rates; larger means
    /// better-separated clusters
    pub separation: f32,
    pub overdisp: f32,
    pub binary: bool,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            n_examples: 200,
            n_features: 20,
            n_clusters: 3,
            depth: 50.,
            separation: 20.,
            overdisp: 1.,
            binary: false,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    pub data_set: DataSet,
    pub cluster_assignment: Vec<usize>,
    pub rate_kd: Mat,
}

/// Generate a count matrix with `n_clusters` well-separated blocks:
///
/// ```text
/// Y(i,j) ~ Poisson( depth * rho(c(i), j) ),   rho(k, .) on the simplex
/// ```
///
/// Each cluster concentrates its mass on a distinct block of features
/// scaled by `separation` over the background. Examples are assigned to
/// clusters round-robin so every cluster has `n/K` members.
pub fn generate_clustered_count_data(args: &SimArgs) -> anyhow::Result<SimOut> {
    anyhow::ensure!(args.n_clusters > 0, "need at least one cluster");
    anyhow::ensure!(
        args.n_features >= args.n_clusters,
        "need at least one feature per cluster"
    );

    let mut rng = StdRng::seed_from_u64(args.rseed);

    let kk = args.n_clusters;
    let nn = args.n_examples;
    let dd = args.n_features;

    let gamma = Gamma::new(args.overdisp as f64, 1. / args.overdisp as f64)?;

    // per-cluster feature intensities, block-diagonal up to noise
    let mut rate_kd = Mat::zeros(kk, dd);
    for k in 0..kk {
        let lb = k * dd / kk;
        let ub = (k + 1) * dd / kk;
        for j in 0..dd {
            let base = if j >= lb && j < ub {
                args.separation
            } else {
                1.
            };
            rate_kd[(k, j)] = base * gamma.sample(&mut rng) as f32;
        }
        let tot = rate_kd.row(k).sum();
        for j in 0..dd {
            rate_kd[(k, j)] /= tot;
        }
    }

    let cluster_assignment: Vec<usize> = (0..nn).map(|i| i % kk).collect();

    let mut values = Mat::zeros(nn, dd);
    for i in 0..nn {
        let k = cluster_assignment[i];
        for j in 0..dd {
            let lambda = (args.depth * rate_kd[(k, j)]).max(1e-8) as f64;
            let y = Poisson::new(lambda)?.sample(&mut rng) as f32;
            values[(i, j)] = if args.binary {
                // thin to a binary observation while keeping separation
                let p = (1. - (-lambda).exp()).clamp(1e-3, 1. - 1e-3);
                if Bernoulli::new(p)?.sample(&mut rng) {
                    1.
                } else {
                    0.
                }
            } else {
                y
            };
        }
    }

    let labels: Vec<String> = cluster_assignment
        .iter()
        .map(|&k| format!("cluster {}", k + 1))
        .collect();

    info!(
        "simulated {} x {} count matrix with {} clusters",
        nn, dd, kk
    );

    let data_set = DataSet::new(DataSetArgs {
        name: "simulated".to_string(),
        kind: DataKind::Training,
        values,
        labels: Some(labels),
        ..DataSetArgs::default()
    })?;

    Ok(SimOut {
        data_set,
        cluster_assignment,
        rate_kd,
    })
}

/// Split a simulation into training and validation records by taking
/// every `holdout`-th example for validation.
pub fn split_for_validation(sim: &SimOut, holdout: usize) -> anyhow::Result<(DataSet, DataSet)> {
    anyhow::ensure!(holdout >= 2, "holdout period must be at least 2");

    let values = sim.data_set.values();
    let labels = sim.data_set.labels();

    let mut train_rows = vec![];
    let mut valid_rows = vec![];
    for i in 0..values.nrows() {
        if i % holdout == 0 {
            valid_rows.push(i);
        } else {
            train_rows.push(i);
        }
    }

    let take = |rows: &[usize], kind: DataKind| -> anyhow::Result<DataSet> {
        let mut x = Mat::zeros(rows.len(), values.ncols());
        for (r, &i) in rows.iter().enumerate() {
            x.set_row(r, &values.row(i));
        }
        let y = labels.map(|labels| rows.iter().map(|&i| labels[i].clone()).collect());
        DataSet::new(DataSetArgs {
            name: sim.data_set.name.clone(),
            kind,
            values: x,
            labels: y,
            ..DataSetArgs::default()
        })
    };

    Ok((
        take(&train_rows, DataKind::Training)?,
        take(&valid_rows, DataKind::Validation)?,
    ))
}
