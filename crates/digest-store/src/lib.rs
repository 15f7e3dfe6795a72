//! Digest storage abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digest_types::{DigestEntry, EntryValidationError, Item, Reader};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

mod search;
mod sqlite;

pub use search::{cosine_similarity, rank_by_similarity};
pub use sqlite::SqliteDigestStore;

/// Result type for digest store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("digest entry rejected: {0}")]
    InvalidEntry(#[from] EntryValidationError),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Identifier assigned to the `sequence`-th entry stored for `version`.
pub fn digest_entry_id(version: i64, sequence: usize) -> String {
    format!("{version}-{sequence}")
}

/// Async store contract used by the batch coordinator and the matcher.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Items created within `[window_start, window_end]`, oldest first.
    async fn fetch_items(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> StoreResult<Vec<Item>>;
    /// Inserts an item, replacing any item with the same id.
    async fn insert_item(&self, item: Item) -> StoreResult<()>;

    /// Persists a digest entry and returns its assigned id.
    async fn insert_digest_entry(&self, entry: DigestEntry) -> StoreResult<String>;
    async fn get_digest_entry(&self, entry_id: &str) -> StoreResult<Option<DigestEntry>>;
    async fn latest_digest_version(&self) -> StoreResult<Option<i64>>;
    /// Ids of entries of `version` ranked by cosine similarity to `query`.
    async fn vector_search_digests(
        &self,
        query: &[f32],
        version: i64,
        num_candidates: usize,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    /// Returns the reader or `StoreError::NotFound`.
    async fn get_reader(&self, reader_id: &str) -> StoreResult<Reader>;
    async fn upsert_reader(&self, reader: Reader) -> StoreResult<()>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryDigestStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    items: HashMap<String, Item>,
    entries: BTreeMap<String, DigestEntry>,
    entries_per_version: HashMap<i64, usize>,
    readers: HashMap<String, Reader>,
}

impl InMemoryDigestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored digest entries across all versions.
    pub async fn digest_entry_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

#[async_trait]
impl DigestStore for InMemoryDigestStore {
    async fn fetch_items(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> StoreResult<Vec<Item>> {
        let inner = self.inner.read().await;
        let mut items = inner
            .items
            .values()
            .filter(|item| item.created_at >= window_start && item.created_at <= window_end)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(items)
    }

    async fn insert_item(&self, item: Item) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.items.insert(item.id.clone(), item);
        Ok(())
    }

    async fn insert_digest_entry(&self, mut entry: DigestEntry) -> StoreResult<String> {
        entry.validate()?;
        let mut inner = self.inner.write().await;
        let sequence = inner.entries_per_version.entry(entry.version).or_insert(0);
        let entry_id = digest_entry_id(entry.version, *sequence);
        *sequence += 1;

        entry.id = Some(entry_id.clone());
        inner.entries.insert(entry_id.clone(), entry);
        Ok(entry_id)
    }

    async fn get_digest_entry(&self, entry_id: &str) -> StoreResult<Option<DigestEntry>> {
        Ok(self.inner.read().await.entries.get(entry_id).cloned())
    }

    async fn latest_digest_version(&self) -> StoreResult<Option<i64>> {
        Ok(self.inner.read().await.entries_per_version.keys().copied().max())
    }

    async fn vector_search_digests(
        &self,
        query: &[f32],
        version: i64,
        num_candidates: usize,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        let candidates = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.version == version)
            .map(|(id, entry)| (id.as_str(), entry.embedding.as_slice()));
        Ok(rank_by_similarity(query, candidates, num_candidates, limit))
    }

    async fn get_reader(&self, reader_id: &str) -> StoreResult<Reader> {
        self.inner
            .read()
            .await
            .readers
            .get(reader_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "reader",
                id: reader_id.to_string(),
            })
    }

    async fn upsert_reader(&self, reader: Reader) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.readers.insert(reader.id.clone(), reader);
        Ok(())
    }
}
