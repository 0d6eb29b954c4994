#![allow(dead_code)]

use candle_core::{Device, Tensor};
use count_data::DataSet;
use log::warn;
use nalgebra::DMatrix;
use ndarray::Array2;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::model_config::GmvaeConfig;

/// Seed of the permutation that selects which labeled examples feed
/// the supervised term; fixed so resumed runs mask the same examples.
const LABEL_MASK_SEED: u64 = 42;

/// One rectangular slice of the data moved onto the compute device.
pub struct MinibatchData {
    /// encoder input `(b, d)`
    pub input: Tensor,
    /// reconstruction target `(b, d)`, possibly binarised
    pub target: Tensor,
    /// one-hot labels `(b, c)`
    pub labels: Option<Tensor>,
    /// 1 where the label may enter the supervised loss, `(b,)`
    pub clf_mask: Option<Tensor>,
    /// per-example total count `(b, 1)`
    pub count_sum: Option<Tensor>,
    /// count sum scaled into `[0, 1]`, `(b, 1)`
    pub normalised_count_sum: Option<Tensor>,
}

impl MinibatchData {
    pub fn batch_size(&self) -> usize {
        self.input.dims()[0]
    }
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn minibatch_ordered(
        &self,
        batch_idx: usize,
        batch_size: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_data(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

pub struct DataLoaderArgs<'a, D>
where
    D: RowsToTensorVec,
{
    pub input: &'a D,
    pub target: Option<&'a D>,
    pub labels: Option<&'a D>,
    pub clf_mask: Option<&'a D>,
    pub count_sum: Option<&'a D>,
    pub normalised_count_sum: Option<&'a D>,
}

///
/// A simple data loader for in-memory 2d matrices. Each row is one
/// example; all slots share row order.
///
pub struct InMemoryData {
    input_rows: Vec<Tensor>,
    target_rows: Option<Vec<Tensor>>,
    label_rows: Option<Vec<Tensor>>,
    mask_rows: Option<Vec<Tensor>>,
    count_rows: Option<Vec<Tensor>>,
    norm_count_rows: Option<Vec<Tensor>>,
    minibatches: Minibatches,
}

impl InMemoryData {
    pub fn from<D>(args: DataLoaderArgs<D>) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input_rows = args.input.rows_to_tensor_vec();
        let rows = (0..input_rows.len()).collect();

        let optional = |slot: Option<&D>| slot.map(|m| m.rows_to_tensor_vec());

        let target_rows = optional(args.target);
        let label_rows = optional(args.labels);
        let mask_rows = optional(args.clf_mask);
        let count_rows = optional(args.count_sum);
        let norm_count_rows = optional(args.normalised_count_sum);

        for slot in [
            &target_rows,
            &label_rows,
            &mask_rows,
            &count_rows,
            &norm_count_rows,
        ]
        .into_iter()
        .flatten()
        {
            anyhow::ensure!(
                slot.len() == input_rows.len(),
                "all loader slots need one row per example"
            );
        }

        Ok(InMemoryData {
            input_rows,
            target_rows,
            label_rows,
            mask_rows,
            count_rows,
            norm_count_rows,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }

    /// Assemble a loader directly from a data-set record, deriving the
    /// target view, one-hot labels, label mask and count-sum columns
    /// the model configuration asks for.
    pub fn from_data_set(config: &GmvaeConfig, data_set: &DataSet) -> anyhow::Result<Self> {
        let x = data_set.input_values().clone();
        let t = if config.reconstruction.binarised_target() {
            data_set.binarised_values()
        } else {
            data_set.values().clone()
        };

        let n = data_set.number_of_examples();

        let labels = match data_set.label_ids() {
            Some(ids) if data_set.number_of_classes() == config.n_clusters => {
                let mut onehot = DMatrix::<f32>::zeros(n, config.n_clusters);
                for (i, &id) in ids.iter().enumerate() {
                    onehot[(i, id)] = 1.;
                }
                Some(onehot)
            }
            Some(_) => {
                warn!(
                    "{} classes but K = {}; supervised term disabled",
                    data_set.number_of_classes(),
                    config.n_clusters
                );
                None
            }
            None => None,
        };

        let mask = labels.as_ref().map(|_| {
            let mut mask = DMatrix::<f32>::zeros(n, 1);
            let mut order: Vec<usize> = (0..n).collect();
            let mut rng = StdRng::seed_from_u64(LABEL_MASK_SEED);
            order.shuffle(&mut rng);
            for &i in order.iter().take(config.n_labeled_examples) {
                mask[(i, 0)] = 1.;
            }
            mask
        });

        let count_sum = config.reconstruction.needs_count_sum().then(|| {
            DMatrix::<f32>::from_iterator(n, 1, data_set.count_sum().iter().cloned())
        });
        let norm_count_sum = config.count_sum_feature.then(|| {
            DMatrix::<f32>::from_iterator(n, 1, data_set.normalised_count_sum().iter().cloned())
        });

        Self::from(DataLoaderArgs {
            input: &x,
            target: Some(&t),
            labels: labels.as_ref(),
            clf_mask: mask.as_ref(),
            count_sum: count_sum.as_ref(),
            normalised_count_sum: norm_count_sum.as_ref(),
        })
    }

    fn gather(
        rows: Option<&Vec<Tensor>>,
        samples: &[usize],
        device: &Device,
    ) -> anyhow::Result<Option<Tensor>> {
        if let Some(rows) = rows {
            let chunk: Vec<Tensor> = samples.iter().map(|&i| rows[i].clone()).collect();
            Ok(Some(Tensor::cat(&chunk, 0)?.to_device(device)?))
        } else {
            Ok(None)
        }
    }

    fn assemble(&self, samples: &[usize], device: &Device) -> anyhow::Result<MinibatchData> {
        let input = Self::gather(Some(&self.input_rows), samples, device)?
            .ok_or_else(|| anyhow::anyhow!("empty input slot"))?;
        let target = match Self::gather(self.target_rows.as_ref(), samples, device)? {
            Some(t) => t,
            None => input.clone(),
        };
        let clf_mask = Self::gather(self.mask_rows.as_ref(), samples, device)?
            .map(|m| m.squeeze(1))
            .transpose()?;

        Ok(MinibatchData {
            input,
            target,
            labels: Self::gather(self.label_rows.as_ref(), samples, device)?,
            clf_mask,
            count_sum: Self::gather(self.count_rows.as_ref(), samples, device)?,
            normalised_count_sum: Self::gather(self.norm_count_rows.as_ref(), samples, device)?,
        })
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let samples = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;
        self.assemble(samples, target_device)
    }

    fn minibatch_ordered(
        &self,
        batch_idx: usize,
        batch_size: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let lb = batch_idx * batch_size;
        anyhow::ensure!(lb < self.num_data(), "batch index beyond data");
        let ub = (lb + batch_size).min(self.num_data());
        let samples: Vec<usize> = (lb..ub).collect();
        self.assemble(&samples, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.input_rows.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        Ok(())
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut idx_data = self
            .axis_iter(ndarray::Axis(0))
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let mut v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .expect("failed to create tensor");
                v = v.reshape((1, row.len())).expect("failed to reshape");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let mut v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .expect("failed to create tensor");
                v = v.reshape((1, row.len())).expect("failed to reshape");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for nalgebra_sparse::CscMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut dense = vec![vec![0f32; self.ncols()]; self.nrows()];
        for (j, col) in self.col_iter().enumerate() {
            for (&i, &x) in col.row_indices().iter().zip(col.values()) {
                dense[i][j] = x;
            }
        }
        dense
            .into_iter()
            .map(|row| {
                let d = row.len();
                Tensor::from_vec(row, (1, d), &Device::Cpu).expect("failed to create tensor")
            })
            .collect()
    }
}
