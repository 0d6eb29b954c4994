#![allow(dead_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

/// Which split of the data this record represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Training,
    Validation,
    Test,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Training => "training",
            DataKind::Validation => "validation",
            DataKind::Test => "test",
        }
    }
}

/// Which view of the data the `values` matrix holds. Model evaluation
/// produces `Transformed`, `Reconstructed`, `LatentZ` and `LatentY`
/// records shaped like the original data set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataVersion {
    Original,
    Transformed,
    Reconstructed,
    LatentZ,
    LatentY,
}

pub struct DataSetArgs {
    pub name: String,
    pub kind: DataKind,
    pub version: DataVersion,
    pub values: Mat,
    pub preprocessed_values: Option<Mat>,
    pub labels: Option<Vec<String>>,
    pub superset_labels: Option<Vec<String>>,
    pub excluded_classes: Vec<String>,
    pub example_names: Option<Vec<String>>,
    pub feature_names: Option<Vec<String>>,
    pub total_standard_deviations: Option<Mat>,
    pub explained_standard_deviations: Option<Mat>,
}

impl Default for DataSetArgs {
    fn default() -> Self {
        Self {
            name: "data".to_string(),
            kind: DataKind::Training,
            version: DataVersion::Original,
            values: Mat::zeros(0, 0),
            preprocessed_values: None,
            labels: None,
            superset_labels: None,
            excluded_classes: vec![],
            example_names: None,
            feature_names: None,
            total_standard_deviations: None,
            explained_standard_deviations: None,
        }
    }
}

/// A read-only record of one data split: an example x feature count
/// matrix with optional labels and derived summaries. How the values
/// were acquired or feature-selected is not this crate's business.
#[derive(Debug)]
pub struct DataSet {
    pub name: String,
    pub kind: DataKind,
    pub version: DataVersion,
    values: Mat,
    preprocessed_values: Option<Mat>,
    labels: Option<Vec<String>>,
    class_names: Vec<String>,
    class_name_to_id: HashMap<String, usize>,
    superset_labels: Option<Vec<String>>,
    superset_class_names: Vec<String>,
    superset_class_name_to_id: HashMap<String, usize>,
    excluded_classes: Vec<String>,
    example_names: Vec<String>,
    feature_names: Vec<String>,
    total_standard_deviations: Option<Mat>,
    explained_standard_deviations: Option<Mat>,
    predicted_cluster_ids: Option<Vec<usize>>,
    predicted_labels: Option<Vec<String>>,
}

fn name_bijection(labels: Option<&Vec<String>>) -> (Vec<String>, HashMap<String, usize>) {
    let class_names: Vec<String> = match labels {
        Some(labels) => {
            let mut unique = labels.clone();
            unique.sort();
            unique.dedup();
            unique
        }
        None => vec![],
    };
    let lookup = class_names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect();
    (class_names, lookup)
}

impl DataSet {
    pub fn new(args: DataSetArgs) -> anyhow::Result<Self> {
        let n = args.values.nrows();
        let d = args.values.ncols();

        if let Some(labels) = args.labels.as_ref() {
            anyhow::ensure!(
                labels.len() == n,
                "{} labels for {} examples",
                labels.len(),
                n
            );
        }

        if let Some(x) = args.preprocessed_values.as_ref() {
            anyhow::ensure!(
                x.shape() == args.values.shape(),
                "preprocessed values shape mismatch"
            );
        }

        let example_names = args
            .example_names
            .unwrap_or_else(|| (0..n).map(|i| format!("example {}", i + 1)).collect());
        let feature_names = args
            .feature_names
            .unwrap_or_else(|| (0..d).map(|j| format!("feature {}", j + 1)).collect());

        anyhow::ensure!(example_names.len() == n, "example name array mismatch");
        anyhow::ensure!(feature_names.len() == d, "feature name array mismatch");

        let (class_names, class_name_to_id) = name_bijection(args.labels.as_ref());
        let (superset_class_names, superset_class_name_to_id) =
            name_bijection(args.superset_labels.as_ref());

        Ok(Self {
            name: args.name,
            kind: args.kind,
            version: args.version,
            values: args.values,
            preprocessed_values: args.preprocessed_values,
            labels: args.labels,
            class_names,
            class_name_to_id,
            superset_labels: args.superset_labels,
            superset_class_names,
            superset_class_name_to_id,
            excluded_classes: args.excluded_classes,
            example_names,
            feature_names,
            total_standard_deviations: args.total_standard_deviations,
            explained_standard_deviations: args.explained_standard_deviations,
            predicted_cluster_ids: None,
            predicted_labels: None,
        })
    }

    /// Build from a sparse column-major count matrix (features are
    /// columns of the dense view).
    pub fn from_csc(name: &str, kind: DataKind, x_nd: &CscMat) -> anyhow::Result<Self> {
        let mut values = Mat::zeros(x_nd.nrows(), x_nd.ncols());
        for (j, col) in x_nd.col_iter().enumerate() {
            for (&i, &x) in col.row_indices().iter().zip(col.values()) {
                values[(i, j)] = x;
            }
        }
        Self::new(DataSetArgs {
            name: name.to_string(),
            kind,
            values,
            ..DataSetArgs::default()
        })
    }

    pub fn number_of_examples(&self) -> usize {
        self.values.nrows()
    }

    pub fn number_of_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &Mat {
        &self.values
    }

    pub fn preprocessed_values(&self) -> Option<&Mat> {
        self.preprocessed_values.as_ref()
    }

    /// Values the encoder should consume: preprocessed if available.
    pub fn input_values(&self) -> &Mat {
        self.preprocessed_values.as_ref().unwrap_or(&self.values)
    }

    /// 0/1 view of the values, computed on demand.
    pub fn binarised_values(&self) -> Mat {
        self.values.map(|x| if x > 0.0 { 1.0 } else { 0.0 })
    }

    /// Per-example total count, `n x 1`.
    pub fn count_sum(&self) -> DVec {
        DVec::from_iterator(
            self.values.nrows(),
            self.values.row_iter().map(|row| row.sum()),
        )
    }

    /// Count sums scaled into `[0, 1]` by the largest total.
    pub fn normalised_count_sum(&self) -> DVec {
        let n = self.count_sum();
        let max = n.max();
        if max > 0.0 {
            n / max
        } else {
            n
        }
    }

    pub fn has_labels(&self) -> bool {
        self.labels.is_some()
    }

    pub fn labels(&self) -> Option<&Vec<String>> {
        self.labels.as_ref()
    }

    pub fn number_of_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn class_name_to_id(&self, name: &str) -> Option<usize> {
        self.class_name_to_id.get(name).copied()
    }

    pub fn class_id_to_name(&self, id: usize) -> Option<&str> {
        self.class_names.get(id).map(|s| s.as_str())
    }

    /// Integer label ids under the name ↔ id bijection.
    pub fn label_ids(&self) -> Option<Vec<usize>> {
        self.labels.as_ref().map(|labels| {
            labels
                .iter()
                .map(|name| self.class_name_to_id[name])
                .collect()
        })
    }

    pub fn has_superset_labels(&self) -> bool {
        self.superset_labels.is_some()
    }

    pub fn superset_labels(&self) -> Option<&Vec<String>> {
        self.superset_labels.as_ref()
    }

    pub fn superset_label_ids(&self) -> Option<Vec<usize>> {
        self.superset_labels.as_ref().map(|labels| {
            labels
                .iter()
                .map(|name| self.superset_class_name_to_id[name])
                .collect()
        })
    }

    pub fn excluded_classes(&self) -> &[String] {
        &self.excluded_classes
    }

    pub fn excluded_class_ids(&self) -> Vec<usize> {
        self.excluded_classes
            .iter()
            .filter_map(|name| self.class_name_to_id.get(name).copied())
            .collect()
    }

    pub fn example_names(&self) -> &[String] {
        &self.example_names
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn total_standard_deviations(&self) -> Option<&Mat> {
        self.total_standard_deviations.as_ref()
    }

    pub fn explained_standard_deviations(&self) -> Option<&Mat> {
        self.explained_standard_deviations.as_ref()
    }

    pub fn predicted_cluster_ids(&self) -> Option<&Vec<usize>> {
        self.predicted_cluster_ids.as_ref()
    }

    pub fn predicted_labels(&self) -> Option<&Vec<String>> {
        self.predicted_labels.as_ref()
    }

    /// Attach model predictions to a result record.
    pub fn update_predictions(
        &mut self,
        predicted_cluster_ids: Option<Vec<usize>>,
        predicted_labels: Option<Vec<String>>,
    ) {
        if predicted_cluster_ids.is_some() {
            self.predicted_cluster_ids = predicted_cluster_ids;
        }
        if predicted_labels.is_some() {
            self.predicted_labels = predicted_labels;
        }
    }

    /// A result record shaped like this data set but holding different
    /// values (e.g. reconstructions or latent coordinates).
    pub fn derive(&self, version: DataVersion, values: Mat, feature_names: Option<Vec<String>>) -> anyhow::Result<Self> {
        Self::new(DataSetArgs {
            name: self.name.clone(),
            kind: self.kind,
            version,
            values,
            labels: self.labels.clone(),
            superset_labels: self.superset_labels.clone(),
            excluded_classes: self.excluded_classes.clone(),
            example_names: Some(self.example_names.clone()),
            feature_names,
            ..DataSetArgs::default()
        })
    }
}
