//! Topical clustering of embedded items: manifold reduction, HDBSCAN, and a
//! kNN repair pass that leaves no group smaller than the viable minimum.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use digest_types::{GroupLabel, GroupedItem, Item};
use serde_json::Value;

mod error;
mod hdbscan;
mod reduction;
mod repair;
pub mod space;

pub use error::ClusteringError;
pub use hdbscan::{hdbscan, HdbscanParams};
pub use reduction::{
    curve_parameters, fit_curve_parameters, reduce, ReductionConfig, MIN_ROWS_FOR_REDUCTION,
};
pub use repair::{dissolve_small_groups, knn_repair, relabel_dense};

use space::{extract_vectors, DistanceMatrix, ExtractedVectors};

/// Configuration for one clustering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringConfig {
    /// HDBSCAN minimum cluster size (also used as `min_samples`).
    pub min_group_size: usize,
    /// Run manifold reduction before density clustering.
    pub reduce_dimensions: bool,
    pub reduction: ReductionConfig,
    /// Neighbors consulted when repairing noise points.
    pub repair_neighbors: usize,
    /// Groups below this size are dissolved and repaired.
    pub min_viable_group_size: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_group_size: 2,
            reduce_dimensions: true,
            reduction: ReductionConfig::default(),
            repair_neighbors: 3,
            min_viable_group_size: 3,
        }
    }
}

impl ClusteringConfig {
    /// Parses `ClusteringConfig` from a JSON object, keeping defaults for absent keys.
    #[tracing::instrument(level = "debug", skip(value))]
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .context("clustering config JSON payload must be an object")?;
        let mut config = Self::default();

        if let Some(min_group_size) = object.get("min_group_size") {
            config.min_group_size = parse_count(min_group_size, "min_group_size")?;
        }
        if let Some(reduce_dimensions) = object.get("reduce_dimensions") {
            config.reduce_dimensions = reduce_dimensions
                .as_bool()
                .context("clustering config field 'reduce_dimensions' must be boolean")?;
        }
        if let Some(reduction) = object.get("reduction") {
            config.reduction = ReductionConfig::from_json(reduction)
                .context("clustering config field 'reduction' is invalid")?;
        }
        if let Some(repair_neighbors) = object.get("repair_neighbors") {
            config.repair_neighbors = parse_count(repair_neighbors, "repair_neighbors")?;
        }
        if let Some(min_viable) = object.get("min_viable_group_size") {
            config.min_viable_group_size = parse_count(min_viable, "min_viable_group_size")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClusteringError> {
        HdbscanParams::new(self.min_group_size).validate()?;
        if self.repair_neighbors == 0 {
            return Err(ClusteringError::InvalidParameter(
                "repair_neighbors must be >= 1".to_string(),
            ));
        }
        if self.min_viable_group_size == 0 {
            return Err(ClusteringError::InvalidParameter(
                "min_viable_group_size must be >= 1".to_string(),
            ));
        }
        if self.reduce_dimensions {
            self.reduction.validate()?;
        }
        Ok(())
    }
}

fn parse_count(value: &Value, field: &str) -> Result<usize> {
    let raw = value
        .as_u64()
        .with_context(|| format!("clustering config field '{field}' must be an unsigned integer"))?;
    usize::try_from(raw).with_context(|| format!("clustering config field '{field}' is too large"))
}

/// Groups `items` by topic.
///
/// Items without a usable embedding are dropped and do not appear in the
/// output. Every returned group has at least `min_viable_group_size` members;
/// when no group survives, the remaining items come back as noise.
pub fn cluster(
    items: Vec<Item>,
    config: &ClusteringConfig,
) -> Result<Vec<GroupedItem>, ClusteringError> {
    config.validate()?;

    let ExtractedVectors {
        items,
        matrix,
        dropped,
    } = extract_vectors(items);
    if dropped > 0 {
        tracing::info!(dropped, kept = items.len(), "dropped items without usable embeddings");
    }
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let space = if config.reduce_dimensions {
        reduce(&matrix, &config.reduction)?
    } else {
        matrix
    };
    let distances = DistanceMatrix::from_embeddings(&space);

    let mut labels = hdbscan(&distances, &HdbscanParams::new(config.min_group_size))?;
    let first_pass = knn_repair(&distances, &mut labels, config.repair_neighbors);
    let dissolved = dissolve_small_groups(&mut labels, config.min_viable_group_size);
    let second_pass = knn_repair(&distances, &mut labels, config.repair_neighbors);
    relabel_dense(&mut labels);

    let grouped = items
        .into_iter()
        .zip(labels)
        .map(|(item, label)| GroupedItem::new(item, label))
        .collect::<Vec<_>>();

    let summary = summarize_groups(&grouped);
    tracing::debug!(
        first_pass,
        dissolved,
        second_pass,
        groups = summary.keys().filter(|label| !label.is_noise()).count(),
        ?summary,
        "clustering complete"
    );
    Ok(grouped)
}

/// Member count per label, noise included.
pub fn summarize_groups(grouped: &[GroupedItem]) -> BTreeMap<GroupLabel, usize> {
    let mut summary = BTreeMap::new();
    for item in grouped {
        *summary.entry(item.group).or_insert(0) += 1;
    }
    summary
}
