//! Helpers for pulling numeric vectors out of item records.

use digest_types::Item;

use crate::ClusteringError;

/// Dense row-major matrix of embedding coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    rows: usize,
    dims: usize,
    data: Vec<f64>,
}

impl EmbeddingMatrix {
    /// Creates a zero-filled matrix.
    pub fn zeros(rows: usize, dims: usize) -> Self {
        Self {
            rows,
            dims,
            data: vec![0.0; rows * dims],
        }
    }

    /// Builds a matrix from equally sized rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ClusteringError> {
        let dims = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * dims);
        for row in rows {
            if row.len() != dims {
                return Err(ClusteringError::DimensionMismatch {
                    expected: dims,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            dims,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, index: usize) -> &[f64] {
        let start = index * self.dims;
        &self.data[start..start + self.dims]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        let start = index * self.dims;
        &mut self.data[start..start + self.dims]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Fails when any coordinate is NaN or infinite.
    pub fn ensure_finite(&self, stage: &'static str) -> Result<(), ClusteringError> {
        if self.data.iter().any(|value| !value.is_finite()) {
            return Err(ClusteringError::NonFinite { stage });
        }
        Ok(())
    }
}

/// Items that survived vector extraction, aligned with matrix rows.
#[derive(Debug, Clone)]
pub struct ExtractedVectors {
    pub items: Vec<Item>,
    pub matrix: EmbeddingMatrix,
    pub dropped: usize,
}

/// Extracts the embedding matrix from `items`.
///
/// Items with a missing, empty, or non-finite embedding are dropped. The batch
/// dimension is the most common length among the remaining embeddings (ties go
/// to the length seen first); items that disagree with it are dropped as well.
pub fn extract_vectors(items: Vec<Item>) -> ExtractedVectors {
    let total = items.len();
    let usable = items
        .into_iter()
        .filter(|item| {
            item.embedding.as_deref().is_some_and(|embedding| {
                !embedding.is_empty() && embedding.iter().all(|value| value.is_finite())
            })
        })
        .collect::<Vec<_>>();
    let dims = majority_dimension(&usable);

    let mut kept = Vec::with_capacity(usable.len());
    let mut rows = Vec::with_capacity(usable.len());
    for item in usable {
        let embedding = item.embedding.as_deref().unwrap_or_default();
        if Some(embedding.len()) != dims {
            tracing::debug!(
                item_id = %item.id,
                expected = dims.unwrap_or(0),
                actual = embedding.len(),
                "dropping item with mismatched embedding dimension"
            );
            continue;
        }
        rows.push(embedding.iter().map(|value| f64::from(*value)).collect::<Vec<_>>());
        kept.push(item);
    }

    let mut matrix = EmbeddingMatrix::zeros(rows.len(), dims.unwrap_or(0));
    for (index, row) in rows.iter().enumerate() {
        matrix.row_mut(index).copy_from_slice(row);
    }

    ExtractedVectors {
        dropped: total - kept.len(),
        items: kept,
        matrix,
    }
}

fn majority_dimension(items: &[Item]) -> Option<usize> {
    // (length, count, first position)
    let mut tallies: Vec<(usize, usize, usize)> = Vec::new();
    for (position, item) in items.iter().enumerate() {
        let length = item.embedding.as_ref().map_or(0, Vec::len);
        match tallies.iter_mut().find(|(seen, _, _)| *seen == length) {
            Some((_, count, _)) => *count += 1,
            None => tallies.push((length, 1, position)),
        }
    }
    tallies
        .into_iter()
        .max_by(|left, right| left.1.cmp(&right.1).then(right.2.cmp(&left.2)))
        .map(|(length, _, _)| length)
}

pub fn squared_distance(left: &[f64], right: &[f64]) -> f64 {
    left.iter()
        .zip(right)
        .map(|(left, right)| {
            let delta = left - right;
            delta * delta
        })
        .sum()
}

pub fn euclidean_distance(left: &[f64], right: &[f64]) -> f64 {
    squared_distance(left, right).sqrt()
}

/// Symmetric dense matrix of pairwise Euclidean distances.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    size: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    pub fn from_embeddings(matrix: &EmbeddingMatrix) -> Self {
        let size = matrix.rows();
        let mut values = vec![0.0; size * size];
        for left in 0..size {
            for right in (left + 1)..size {
                let distance = euclidean_distance(matrix.row(left), matrix.row(right));
                values[left * size + right] = distance;
                values[right * size + left] = distance;
            }
        }
        Self { size, values }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, left: usize, right: usize) -> f64 {
        self.values[left * self.size + right]
    }

    /// Indices of the `k` nearest other points, closest first, ties by index.
    pub fn nearest(&self, index: usize, k: usize) -> Vec<usize> {
        let mut others = (0..self.size)
            .filter(|other| *other != index)
            .collect::<Vec<_>>();
        others.sort_by(|left, right| {
            self.get(index, *left)
                .total_cmp(&self.get(index, *right))
                .then_with(|| left.cmp(right))
        });
        others.truncate(k);
        others
    }
}
