//! Exact cosine-similarity ranking shared by the store backends.

use std::cmp::Ordering;

/// Cosine similarity of two equally sized vectors.
///
/// Returns `None` when the lengths differ, either vector has zero norm, or the
/// result is not finite.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> Option<f64> {
    if left.len() != right.len() || left.is_empty() {
        return None;
    }
    let mut dot = 0.0_f64;
    let mut left_norm = 0.0_f64;
    let mut right_norm = 0.0_f64;
    for (left, right) in left.iter().zip(right) {
        let (left, right) = (f64::from(*left), f64::from(*right));
        dot += left * right;
        left_norm += left * left;
        right_norm += right * right;
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return None;
    }
    let similarity = dot / (left_norm.sqrt() * right_norm.sqrt());
    similarity.is_finite().then_some(similarity)
}

/// Ranks `candidates` by similarity to `query`, most similar first, ties by id.
///
/// The best `num_candidates` form the candidate pool, which is then cut to
/// `limit`. Candidates that cannot be scored are skipped.
pub fn rank_by_similarity<'a, I>(
    query: &[f32],
    candidates: I,
    num_candidates: usize,
    limit: usize,
) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a [f32])>,
{
    let mut scored = candidates
        .into_iter()
        .filter_map(|(id, embedding)| {
            cosine_similarity(query, embedding).map(|score| (id, score))
        })
        .collect::<Vec<_>>();
    scored.sort_by(|left, right| {
        right
            .1
            .partial_cmp(&left.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.0.cmp(right.0))
    });
    scored.truncate(num_candidates);
    scored.truncate(limit);
    scored.into_iter().map(|(id, _)| id.to_string()).collect()
}
