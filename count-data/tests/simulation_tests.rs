use count_data::simulate::*;
use count_data::*;

#[test]
fn clustered_simulation_shapes_and_labels() -> anyhow::Result<()> {
    let args = SimArgs {
        n_examples: 60,
        n_features: 12,
        n_clusters: 3,
        rseed: 7,
        ..SimArgs::default()
    };

    let sim = generate_clustered_count_data(&args)?;
    let data = &sim.data_set;

    assert_eq!(data.number_of_examples(), 60);
    assert_eq!(data.number_of_features(), 12);
    assert_eq!(data.number_of_classes(), 3);
    assert!(data.has_labels());
    assert_eq!(sim.cluster_assignment.len(), 60);

    // every cluster gets the same share of examples
    for k in 0..3 {
        let members = sim.cluster_assignment.iter().filter(|&&c| c == k).count();
        assert_eq!(members, 20);
    }

    // counts are non-negative and the per-cluster rates normalised
    assert!(data.values().iter().all(|&x| x >= 0.));
    for k in 0..3 {
        let total: f32 = sim.rate_kd.row(k).sum();
        assert!((total - 1.).abs() < 1e-4);
    }

    Ok(())
}

#[test]
fn binarised_values_and_count_sums() -> anyhow::Result<()> {
    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: 30,
        n_features: 10,
        rseed: 3,
        ..SimArgs::default()
    })?;
    let data = &sim.data_set;

    let binary = data.binarised_values();
    assert!(binary.iter().all(|&x| x == 0. || x == 1.));

    let n = data.count_sum();
    for (i, row) in data.values().row_iter().enumerate() {
        assert!((n[i] - row.sum()).abs() < 1e-3);
    }

    let normalised = data.normalised_count_sum();
    assert!(normalised.iter().all(|&x| (0. ..=1.).contains(&x)));
    assert!((normalised.max() - 1.).abs() < 1e-6);

    Ok(())
}

#[test]
fn validation_split_partitions_examples() -> anyhow::Result<()> {
    let sim = generate_clustered_count_data(&SimArgs {
        n_examples: 40,
        n_features: 8,
        rseed: 11,
        ..SimArgs::default()
    })?;

    let (training, validation) = split_for_validation(&sim, 4)?;

    assert_eq!(training.kind, DataKind::Training);
    assert_eq!(validation.kind, DataKind::Validation);
    assert_eq!(training.number_of_examples(), 30);
    assert_eq!(validation.number_of_examples(), 10);
    assert!(training.has_labels() && validation.has_labels());

    Ok(())
}

#[test]
fn label_bijection_round_trips() -> anyhow::Result<()> {
    let data = DataSet::new(DataSetArgs {
        values: Mat::zeros(4, 2),
        labels: Some(vec![
            "beta".to_string(),
            "alpha".to_string(),
            "beta".to_string(),
            "gamma".to_string(),
        ]),
        ..DataSetArgs::default()
    })?;

    assert_eq!(data.number_of_classes(), 3);
    let ids = data.label_ids().unwrap();
    for (name, &id) in data.labels().unwrap().iter().zip(ids.iter()) {
        assert_eq!(data.class_name_to_id(name), Some(id));
        assert_eq!(data.class_id_to_name(id), Some(name.as_str()));
    }

    Ok(())
}

#[test]
fn sparse_input_matches_dense_view() -> anyhow::Result<()> {
    use nalgebra_sparse::CooMatrix;

    let mut coo = CooMatrix::new(3, 4);
    coo.push(0, 1, 2.);
    coo.push(2, 3, 5.);
    coo.push(1, 0, 1.);
    let csc = CscMat::from(&coo);

    let data = DataSet::from_csc("sparse", DataKind::Test, &csc)?;
    assert_eq!(data.number_of_examples(), 3);
    assert_eq!(data.number_of_features(), 4);
    assert_eq!(data.values()[(0, 1)], 2.);
    assert_eq!(data.values()[(2, 3)], 5.);
    assert_eq!(data.values()[(1, 0)], 1.);
    assert_eq!(data.values()[(0, 0)], 0.);

    Ok(())
}
