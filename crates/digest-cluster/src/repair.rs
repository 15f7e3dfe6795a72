use std::collections::BTreeMap;

use digest_types::GroupLabel;

use crate::space::DistanceMatrix;

/// Reassigns every noise point by a uniform k-nearest-neighbor vote over the
/// labelled points. Returns the number of reassigned points.
///
/// Predictions are computed against the labels as they were on entry, so the
/// order of noise points does not matter. Vote ties go to the smallest label.
pub fn knn_repair(
    distances: &DistanceMatrix,
    labels: &mut [GroupLabel],
    neighbors: usize,
) -> usize {
    let training = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| !label.is_noise())
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    if training.is_empty() || neighbors == 0 {
        return 0;
    }
    let neighbors = neighbors.min(training.len());

    // Selection only permutes the buffer, so it is reused across noise points.
    let mut candidates = training;
    let predictions = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| label.is_noise())
        .map(|(index, _)| {
            candidates.select_nth_unstable_by(neighbors - 1, |left, right| {
                distances
                    .get(index, *left)
                    .total_cmp(&distances.get(index, *right))
                    .then_with(|| left.cmp(right))
            });

            let mut votes = BTreeMap::<GroupLabel, usize>::new();
            for neighbor in &candidates[..neighbors] {
                *votes.entry(labels[*neighbor]).or_default() += 1;
            }
            let mut winner = None;
            for (label, count) in votes {
                match winner {
                    Some((_, best)) if count <= best => {}
                    _ => winner = Some((label, count)),
                }
            }
            (index, winner.map(|(label, _)| label).unwrap_or(GroupLabel::Noise))
        })
        .collect::<Vec<_>>();

    let mut reassigned = 0;
    for (index, label) in predictions {
        if !label.is_noise() {
            labels[index] = label;
            reassigned += 1;
        }
    }
    reassigned
}

/// Turns members of groups smaller than `min_size` into noise. Returns the
/// number of affected points.
pub fn dissolve_small_groups(labels: &mut [GroupLabel], min_size: usize) -> usize {
    let mut sizes = BTreeMap::<GroupLabel, usize>::new();
    for label in labels.iter().filter(|label| !label.is_noise()) {
        *sizes.entry(*label).or_default() += 1;
    }

    let mut dissolved = 0;
    for label in labels.iter_mut() {
        if sizes.get(&*label).is_some_and(|size| *size < min_size) {
            *label = GroupLabel::Noise;
            dissolved += 1;
        }
    }
    dissolved
}

/// Renumbers groups `0..n` in order of first appearance.
pub fn relabel_dense(labels: &mut [GroupLabel]) {
    let mut mapping = BTreeMap::new();
    for label in labels.iter_mut() {
        if let GroupLabel::Group(index) = *label {
            let next = mapping.len();
            *label = GroupLabel::Group(*mapping.entry(index).or_insert(next));
        }
    }
}
