#![allow(dead_code)]

use std::collections::HashMap;

/// Map arg-max cluster ids onto ground-truth label ids by majority
/// vote: each cluster adopts the most frequent non-excluded label
/// among its members. Clusters without any eligible member keep an
/// out-of-range id so they never count as correct.
pub fn map_cluster_ids_to_label_ids(
    label_ids: &[usize],
    cluster_ids: &[usize],
    excluded_label_ids: &[usize],
) -> Vec<usize> {
    debug_assert_eq!(label_ids.len(), cluster_ids.len());

    let mut votes: HashMap<usize, HashMap<usize, usize>> = HashMap::new();
    for (&label, &cluster) in label_ids.iter().zip(cluster_ids.iter()) {
        if excluded_label_ids.contains(&label) {
            continue;
        }
        *votes.entry(cluster).or_default().entry(label).or_default() += 1;
    }

    let fallback = label_ids.iter().max().map(|&m| m + 1).unwrap_or(0);
    let cluster_to_label: HashMap<usize, usize> = votes
        .into_iter()
        .map(|(cluster, counts)| {
            let label = counts
                .into_iter()
                .max_by_key(|&(label, count)| (count, usize::MAX - label))
                .map(|(label, _)| label)
                .unwrap_or(fallback);
            (cluster, label)
        })
        .collect();

    cluster_ids
        .iter()
        .map(|cluster| *cluster_to_label.get(cluster).unwrap_or(&fallback))
        .collect()
}

/// Fraction of non-excluded examples whose mapped prediction matches
/// the ground truth.
pub fn accuracy(label_ids: &[usize], predicted_ids: &[usize], excluded_label_ids: &[usize]) -> f32 {
    debug_assert_eq!(label_ids.len(), predicted_ids.len());

    let mut correct = 0usize;
    let mut total = 0usize;
    for (&truth, &predicted) in label_ids.iter().zip(predicted_ids.iter()) {
        if excluded_label_ids.contains(&truth) {
            continue;
        }
        total += 1;
        if truth == predicted {
            correct += 1;
        }
    }
    if total == 0 {
        0.
    } else {
        correct as f32 / total as f32
    }
}
