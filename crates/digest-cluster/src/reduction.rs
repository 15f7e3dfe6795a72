//! Neighbor-graph manifold reduction (UMAP-style) for high-dimensional embeddings.
//!
//! The reducer builds a fuzzy k-nearest-neighbor graph over the input rows,
//! lays the rows out in `n_components` dimensions starting from a seeded
//! random projection, and refines the layout with negative-sampling SGD.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::space::{squared_distance, DistanceMatrix, EmbeddingMatrix};
use crate::ClusteringError;

/// Batches smaller than this are returned unreduced.
pub const MIN_ROWS_FOR_REDUCTION: usize = 4;
pub const DEFAULT_REDUCTION_SEED: u64 = 42;

const SIGMA_SEARCH_ITERATIONS: usize = 64;
const SIGMA_SEARCH_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;
const GRADIENT_CLIP: f64 = 4.0;
const REPULSION_OFFSET: f64 = 1e-3;
const INITIAL_LAYOUT_SCALE: f64 = 10.0;

/// Parameters for the manifold reduction step.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionConfig {
    /// Output dimensionality.
    pub n_components: usize,
    /// Size of the local neighborhood used to build the graph.
    pub n_neighbors: usize,
    /// Minimum spacing of points in the layout.
    pub min_dist: f64,
    /// Scale of the layout.
    pub spread: f64,
    pub n_epochs: usize,
    pub negative_sample_rate: usize,
    pub learning_rate: f64,
    /// Seed for initialization and negative sampling. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            n_components: 2,
            n_neighbors: 15,
            min_dist: 0.1,
            spread: 1.0,
            n_epochs: 200,
            negative_sample_rate: 5,
            learning_rate: 1.0,
            seed: Some(DEFAULT_REDUCTION_SEED),
        }
    }
}

impl ReductionConfig {
    /// Parses `ReductionConfig` from a JSON object, keeping defaults for absent keys.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .context("reduction config JSON payload must be an object")?;
        let mut config = Self::default();

        if let Some(n_components) = object.get("n_components") {
            config.n_components = parse_usize(n_components, "n_components")?;
        }
        if let Some(n_neighbors) = object.get("n_neighbors") {
            config.n_neighbors = parse_usize(n_neighbors, "n_neighbors")?;
        }
        if let Some(min_dist) = object.get("min_dist") {
            config.min_dist = min_dist
                .as_f64()
                .context("reduction config field 'min_dist' must be numeric")?;
        }
        if let Some(spread) = object.get("spread") {
            config.spread = spread
                .as_f64()
                .context("reduction config field 'spread' must be numeric")?;
        }
        if let Some(n_epochs) = object.get("n_epochs") {
            config.n_epochs = parse_usize(n_epochs, "n_epochs")?;
        }
        if let Some(rate) = object.get("negative_sample_rate") {
            config.negative_sample_rate = parse_usize(rate, "negative_sample_rate")?;
        }
        if let Some(learning_rate) = object.get("learning_rate") {
            config.learning_rate = learning_rate
                .as_f64()
                .context("reduction config field 'learning_rate' must be numeric")?;
        }
        if let Some(seed) = object.get("seed") {
            config.seed = if seed.is_null() {
                None
            } else {
                Some(
                    seed.as_u64()
                        .context("reduction config field 'seed' must be an unsigned integer or null")?,
                )
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClusteringError> {
        if self.n_components == 0 {
            return Err(ClusteringError::invalid_parameter(
                "reduction n_components must be >= 1",
            ));
        }
        if self.n_neighbors < 2 {
            return Err(ClusteringError::invalid_parameter(format!(
                "reduction n_neighbors must be >= 2, got {}",
                self.n_neighbors
            )));
        }
        if !self.spread.is_finite() || self.spread <= 0.0 {
            return Err(ClusteringError::invalid_parameter(
                "reduction spread must be finite and > 0.0",
            ));
        }
        if !self.min_dist.is_finite() || self.min_dist < 0.0 || self.min_dist > self.spread {
            return Err(ClusteringError::invalid_parameter(
                "reduction min_dist must be within [0.0, spread]",
            ));
        }
        if self.n_epochs == 0 {
            return Err(ClusteringError::invalid_parameter(
                "reduction n_epochs must be >= 1",
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ClusteringError::invalid_parameter(
                "reduction learning_rate must be finite and > 0.0",
            ));
        }
        Ok(())
    }
}

fn parse_usize(value: &Value, field: &str) -> Result<usize> {
    let raw = value
        .as_u64()
        .with_context(|| format!("reduction config field '{field}' must be an unsigned integer"))?;
    usize::try_from(raw).with_context(|| format!("reduction config field '{field}' is too large"))
}

#[derive(Debug, Clone, Copy)]
struct GraphEdge {
    head: usize,
    tail: usize,
    weight: f64,
}

/// Projects `matrix` into `config.n_components` dimensions.
#[tracing::instrument(
    level = "debug",
    skip(matrix, config),
    fields(rows = matrix.rows(), dims = matrix.dims())
)]
pub fn reduce(
    matrix: &EmbeddingMatrix,
    config: &ReductionConfig,
) -> Result<EmbeddingMatrix, ClusteringError> {
    config.validate()?;
    matrix.ensure_finite("reduction_input")?;

    let rows = matrix.rows();
    if rows < MIN_ROWS_FOR_REDUCTION || rows <= config.n_components {
        return Ok(matrix.clone());
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let distances = DistanceMatrix::from_embeddings(matrix);
    let neighbors = config.n_neighbors.min(rows - 1);
    let edges = fuzzy_neighbor_graph(&distances, neighbors, config.n_epochs);
    let (a, b) = curve_parameters(config.spread, config.min_dist);

    let mut layout = random_projection_layout(matrix, config.n_components, &mut rng);
    optimize_layout(&mut layout, &edges, a, b, config, &mut rng);
    layout.ensure_finite("reduction_output")?;

    tracing::debug!(edges = edges.len(), a, b, "reduced embedding layout");
    Ok(layout)
}

fn fuzzy_neighbor_graph(
    distances: &DistanceMatrix,
    neighbors: usize,
    n_epochs: usize,
) -> Vec<GraphEdge> {
    let rows = distances.size();
    let target = (neighbors as f64).log2();
    let mean_distance = {
        let mut total = 0.0;
        let mut count = 0usize;
        for left in 0..rows {
            for right in (left + 1)..rows {
                total += distances.get(left, right);
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    };

    let mut directed = BTreeMap::new();
    for row in 0..rows {
        let nearest = distances.nearest(row, neighbors);
        let knn = nearest
            .iter()
            .map(|other| distances.get(row, *other))
            .collect::<Vec<_>>();
        let rho = knn.iter().copied().find(|distance| *distance > 0.0).unwrap_or(0.0);
        let sigma = smooth_knn_sigma(&knn, rho, target, mean_distance);

        for (other, distance) in nearest.iter().zip(&knn) {
            let weight = if *distance - rho <= 0.0 {
                1.0
            } else {
                (-(distance - rho) / sigma).exp()
            };
            directed.insert((row, *other), weight);
        }
    }

    // Fuzzy union: w = a + b - a*b.
    let mut symmetric = BTreeMap::new();
    for ((head, tail), weight) in &directed {
        let reverse = directed.get(&(*tail, *head)).copied().unwrap_or(0.0);
        let combined = weight + reverse - weight * reverse;
        symmetric.insert((*head, *tail), combined);
        symmetric.insert((*tail, *head), combined);
    }

    let max_weight = symmetric.values().copied().fold(0.0_f64, f64::max);
    let floor = max_weight / n_epochs as f64;
    symmetric
        .into_iter()
        .filter(|(_, weight)| *weight >= floor && *weight > 0.0)
        .map(|((head, tail), weight)| GraphEdge { head, tail, weight })
        .collect()
}

fn smooth_knn_sigma(knn: &[f64], rho: f64, target: f64, mean_distance: f64) -> f64 {
    let mut low = 0.0;
    let mut high = f64::INFINITY;
    let mut mid = 1.0;

    for _ in 0..SIGMA_SEARCH_ITERATIONS {
        let sum = knn
            .iter()
            .map(|distance| {
                let shifted = distance - rho;
                if shifted > 0.0 {
                    (-shifted / mid).exp()
                } else {
                    1.0
                }
            })
            .sum::<f64>();

        if (sum - target).abs() < SIGMA_SEARCH_TOLERANCE {
            break;
        }
        if sum > target {
            high = mid;
            mid = (low + high) / 2.0;
        } else {
            low = mid;
            if high.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (low + high) / 2.0;
            }
        }
    }

    let local_mean = if knn.is_empty() {
        0.0
    } else {
        knn.iter().sum::<f64>() / knn.len() as f64
    };
    let floor = if rho > 0.0 {
        MIN_K_DIST_SCALE * local_mean
    } else {
        MIN_K_DIST_SCALE * mean_distance
    };
    mid.max(floor).max(f64::MIN_POSITIVE)
}

type CurveKey = (u64, u64);

fn curve_cache() -> &'static Mutex<BTreeMap<CurveKey, (f64, f64)>> {
    static CACHE: OnceLock<Mutex<BTreeMap<CurveKey, (f64, f64)>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Memoized `fit_curve_parameters`, keyed by the exact `(spread, min_dist)` bits.
pub fn curve_parameters(spread: f64, min_dist: f64) -> (f64, f64) {
    let key = (spread.to_bits(), min_dist.to_bits());
    if let Some(cached) = curve_cache()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return *cached;
    }
    let fitted = fit_curve_parameters(spread, min_dist);
    curve_cache()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, fitted);
    fitted
}

/// Fits `a`, `b` so that `1 / (1 + a * x^(2b))` approximates the offset
/// exponential membership curve defined by `spread` and `min_dist`.
pub fn fit_curve_parameters(spread: f64, min_dist: f64) -> (f64, f64) {
    const SAMPLES: usize = 300;
    let xs = (0..SAMPLES)
        .map(|index| spread * 3.0 * index as f64 / (SAMPLES - 1) as f64)
        .collect::<Vec<_>>();
    let ys = xs
        .iter()
        .map(|x| {
            if *x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect::<Vec<_>>();
    let loss = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(x, y)| {
                let predicted = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (predicted - y).powi(2)
            })
            .sum()
    };

    let mut best = (1.0, 1.0, f64::INFINITY);
    for a_step in 1..=200 {
        for b_step in 1..=100 {
            let a = a_step as f64 * 0.05;
            let b = b_step as f64 * 0.02;
            let value = loss(a, b);
            if value < best.2 {
                best = (a, b, value);
            }
        }
    }

    let (coarse_a, coarse_b, _) = best;
    for a_step in -50..=50 {
        for b_step in -50..=50 {
            let a = coarse_a + a_step as f64 * 0.001;
            let b = coarse_b + b_step as f64 * 0.0004;
            if a <= 0.0 || b <= 0.0 {
                continue;
            }
            let value = loss(a, b);
            if value < best.2 {
                best = (a, b, value);
            }
        }
    }

    (best.0, best.1)
}

fn random_projection_layout(
    matrix: &EmbeddingMatrix,
    components: usize,
    rng: &mut StdRng,
) -> EmbeddingMatrix {
    let dims = matrix.dims();
    let projection = (0..dims * components)
        .map(|_| standard_normal(rng))
        .collect::<Vec<_>>();

    let mut layout = EmbeddingMatrix::zeros(matrix.rows(), components);
    for row in 0..matrix.rows() {
        let source = matrix.row(row);
        let target = layout.row_mut(row);
        for (component, slot) in target.iter_mut().enumerate() {
            *slot = source
                .iter()
                .enumerate()
                .map(|(dim, value)| value * projection[dim * components + component])
                .sum();
        }
    }

    for component in 0..components {
        let (min, max) = (0..layout.rows()).fold((f64::INFINITY, f64::NEG_INFINITY), |acc, row| {
            let value = layout.row(row)[component];
            (acc.0.min(value), acc.1.max(value))
        });
        let range = max - min;
        for row in 0..layout.rows() {
            let slot = &mut layout.row_mut(row)[component];
            *slot = if range > 0.0 {
                (*slot - min) / range * INITIAL_LAYOUT_SCALE
            } else {
                0.0
            };
        }
    }
    layout
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    // Box-Muller; 1 - u keeps the logarithm argument in (0, 1].
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn optimize_layout(
    layout: &mut EmbeddingMatrix,
    edges: &[GraphEdge],
    a: f64,
    b: f64,
    config: &ReductionConfig,
    rng: &mut StdRng,
) {
    if edges.is_empty() {
        return;
    }
    let rows = layout.rows();
    let components = layout.dims();
    let max_weight = edges.iter().map(|edge| edge.weight).fold(0.0_f64, f64::max);
    let negative_rate = config.negative_sample_rate.max(1) as f64;

    let epochs_per_sample = edges
        .iter()
        .map(|edge| max_weight / edge.weight)
        .collect::<Vec<_>>();
    let epochs_per_negative = epochs_per_sample
        .iter()
        .map(|value| value / negative_rate)
        .collect::<Vec<_>>();
    let mut next_sample = epochs_per_sample.clone();
    let mut next_negative = epochs_per_negative.clone();

    let coordinates = layout.as_mut_slice();
    for epoch in 0..config.n_epochs {
        let alpha = config.learning_rate * (1.0 - epoch as f64 / config.n_epochs as f64);
        let epoch_f = epoch as f64;

        for (index, edge) in edges.iter().enumerate() {
            if next_sample[index] > epoch_f {
                continue;
            }
            let head = edge.head * components;
            let tail = edge.tail * components;

            let dist_sq = squared_distance(
                &coordinates[head..head + components],
                &coordinates[tail..tail + components],
            );
            if dist_sq > 0.0 {
                let coefficient = -2.0 * a * b * dist_sq.powf(b - 1.0)
                    / (a * dist_sq.powf(b) + 1.0);
                for component in 0..components {
                    let delta = coordinates[head + component] - coordinates[tail + component];
                    let gradient = (coefficient * delta).clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
                    coordinates[head + component] += gradient * alpha;
                    coordinates[tail + component] -= gradient * alpha;
                }
            }
            next_sample[index] += epochs_per_sample[index];

            let negatives = ((epoch_f - next_negative[index]) / epochs_per_negative[index])
                .floor()
                .max(0.0) as usize;
            for _ in 0..negatives {
                let other = rng.gen_range(0..rows);
                if other == edge.head {
                    continue;
                }
                let other = other * components;
                let dist_sq = squared_distance(
                    &coordinates[head..head + components],
                    &coordinates[other..other + components],
                );
                let coefficient = if dist_sq > 0.0 {
                    2.0 * b / ((REPULSION_OFFSET + dist_sq) * (a * dist_sq.powf(b) + 1.0))
                } else {
                    0.0
                };
                for component in 0..components {
                    let gradient = if coefficient > 0.0 {
                        let delta =
                            coordinates[head + component] - coordinates[other + component];
                        (coefficient * delta).clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
                    } else {
                        GRADIENT_CLIP
                    };
                    coordinates[head + component] += gradient * alpha;
                }
            }
            next_negative[index] += negatives as f64 * epochs_per_negative[index];
        }
    }
}
