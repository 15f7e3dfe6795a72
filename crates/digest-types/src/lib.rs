//! Shared data types for the digest clustering and generation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Integer used on the wire for the noise label.
pub const NOISE_LABEL_VALUE: i64 = -1;

const DEFAULT_READ_TIME: i64 = -1;
const DEFAULT_MOOD: &str = "neutral";

fn default_read_time() -> i64 {
    DEFAULT_READ_TIME
}

fn default_mood() -> String {
    DEFAULT_MOOD.to_string()
}

/// Error returned when a digest entry is not fit for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryValidationError {
    #[error("digest entry embedding must not be empty")]
    EmptyEmbedding,
    #[error("digest entry embedding contains non-finite values")]
    NonFiniteEmbedding,
    #[error("digest entry group label must not be empty")]
    EmptyGroupLabel,
}

/// Content record with a precomputed embedding, as produced by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "embeddings")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Creates an item with empty text fields.
    pub fn new(
        id: impl Into<String>,
        embedding: Option<Vec<f32>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            url: String::new(),
            title: String::new(),
            summary: String::new(),
            embedding,
            image: None,
            created_at,
        }
    }

    /// Returns the compact view handed to the generation collaborator.
    pub fn projection(&self) -> ItemProjection {
        ItemProjection {
            title: self.title.clone(),
            summary: self.summary.clone(),
            url: self.url.clone(),
            image: self.image.clone(),
        }
    }
}

/// Cluster assignment for an item within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum GroupLabel {
    /// Not assigned to any group.
    Noise,
    Group(usize),
}

impl GroupLabel {
    pub fn is_noise(self) -> bool {
        matches!(self, Self::Noise)
    }

    /// Returns the group index, or `None` for noise.
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Noise => None,
            Self::Group(index) => Some(index),
        }
    }
}

impl From<i64> for GroupLabel {
    fn from(value: i64) -> Self {
        usize::try_from(value)
            .map(Self::Group)
            .unwrap_or(Self::Noise)
    }
}

impl From<GroupLabel> for i64 {
    fn from(label: GroupLabel) -> Self {
        match label {
            GroupLabel::Noise => NOISE_LABEL_VALUE,
            GroupLabel::Group(index) => i64::try_from(index).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for GroupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Item tagged with its group label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedItem {
    #[serde(flatten)]
    pub item: Item,
    #[serde(alias = "cluster")]
    pub group: GroupLabel,
}

impl GroupedItem {
    pub fn new(item: Item, group: GroupLabel) -> Self {
        Self { item, group }
    }
}

/// Item fields the generation collaborator sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProjection {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub image: Option<String>,
}

/// Everything the generation collaborator receives for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProjection {
    pub group_label: String,
    pub version: i64,
    pub articles: Vec<ItemProjection>,
}

/// One synthesized digest section before embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSection {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub teaser: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub body: Vec<String>,
    #[serde(default)]
    pub article_links: Vec<String>,
    #[serde(default)]
    pub image_url: String,
    #[serde(default = "default_read_time")]
    pub read_time: i64,
    #[serde(default = "default_mood")]
    pub mood: String,
}

impl Default for DigestSection {
    fn default() -> Self {
        Self {
            category: String::new(),
            title: String::new(),
            teaser: String::new(),
            highlights: Vec::new(),
            body: Vec::new(),
            article_links: Vec::new(),
            image_url: String::new(),
            read_time: DEFAULT_READ_TIME,
            mood: default_mood(),
        }
    }
}

impl DigestSection {
    /// Creates a section with the given title and default remaining fields.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Persisted, embedded artifact derived from one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub section: DigestSection,
    #[serde(alias = "embeddings")]
    pub embedding: Vec<f32>,
    #[serde(alias = "cluster")]
    pub group_label: String,
    pub version: i64,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl DigestEntry {
    /// Builds an unsaved entry from a section and its embedding.
    pub fn new(
        section: DigestSection,
        embedding: Vec<f32>,
        group: GroupLabel,
        version: i64,
    ) -> Self {
        Self {
            id: None,
            section,
            embedding,
            group_label: group.to_string(),
            version,
            created_at: Utc::now(),
        }
    }

    /// Checks the fields a store relies on for similarity search.
    pub fn validate(&self) -> Result<(), EntryValidationError> {
        if self.embedding.is_empty() {
            return Err(EntryValidationError::EmptyEmbedding);
        }
        if self.embedding.iter().any(|value| !value.is_finite()) {
            return Err(EntryValidationError::NonFiniteEmbedding);
        }
        if self.group_label.trim().is_empty() {
            return Err(EntryValidationError::EmptyGroupLabel);
        }
        Ok(())
    }
}

/// Reader profile; only the embedding is consumed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reader {
    pub id: String,
    #[serde(alias = "embeddings")]
    pub embedding: Vec<f32>,
}

/// Aggregate outcome of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub version: i64,
    pub items_fetched: usize,
    /// Items without a usable embedding.
    pub items_dropped: usize,
    /// Items left as noise after repair.
    pub items_unassigned: usize,
    pub groups_total: usize,
    pub groups_failed: usize,
    /// Entries persisted successfully.
    pub entries_created: usize,
    /// Sections dropped because their embedding failed.
    pub entries_dropped: usize,
    pub entries_persist_failed: usize,
}

impl BatchReport {
    /// Report for a run that found nothing to do.
    pub fn empty(version: i64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }
}
