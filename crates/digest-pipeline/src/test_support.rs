use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digest_ai::DigestAiError;
use digest_store::{DigestStore, InMemoryDigestStore, StoreError, StoreResult};
use digest_types::{
    DigestEntry, DigestSection, GroupLabel, GroupProjection, GroupedItem, Item, Reader,
};

use crate::generation::{DigestGenerator, TextEmbedder};
use crate::{EmbeddingError, GenerationError};

pub(crate) fn grouped(id: &str, group: GroupLabel) -> GroupedItem {
    let mut item = Item::new(id, Some(vec![0.0, 0.0]), Utc::now());
    item.title = format!("title {id}");
    item.url = format!("https://example.com/{id}");
    GroupedItem::new(item, group)
}

/// Returns the same section titles for every group, failing the listed group labels.
pub(crate) struct ScriptedGenerator {
    titles: Vec<String>,
    failing_groups: Vec<String>,
    projections: Mutex<Vec<GroupProjection>>,
}

impl ScriptedGenerator {
    pub(crate) fn with_sections(titles: &[&str]) -> Self {
        Self {
            titles: titles.iter().map(|title| title.to_string()).collect(),
            failing_groups: Vec::new(),
            projections: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_groups(mut self, groups: &[&str]) -> Self {
        self.failing_groups = groups.iter().map(|group| group.to_string()).collect();
        self
    }

    pub(crate) fn projections(&self) -> Vec<GroupProjection> {
        self.projections.lock().expect("projections lock").clone()
    }
}

#[async_trait]
impl DigestGenerator for ScriptedGenerator {
    async fn synthesize(
        &self,
        projection: &GroupProjection,
    ) -> Result<Vec<DigestSection>, GenerationError> {
        self.projections
            .lock()
            .expect("projections lock")
            .push(projection.clone());
        if self.failing_groups.contains(&projection.group_label) {
            return Err(GenerationError::MalformedResponse(
                "scripted failure".to_string(),
            ));
        }
        Ok(self
            .titles
            .iter()
            .map(|title| DigestSection::titled(title.clone()))
            .collect())
    }
}

/// Embeds any text except text mentioning "unembeddable".
#[derive(Default)]
pub(crate) struct ScriptedEmbedder {
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextEmbedder for ScriptedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("unembeddable") {
            return Err(EmbeddingError::Provider(DigestAiError::HttpStatus {
                status: 500,
                body: "embedding backend down".to_string(),
            }));
        }
        Ok(vec![1.0, text.len() as f32 / 100.0])
    }
}

/// In-memory store with injectable fetch and insert failures.
#[derive(Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: InMemoryDigestStore,
    pub(crate) fail_fetch: bool,
    pub(crate) fail_insert_titles: Vec<String>,
    pub(crate) fetch_windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

#[async_trait]
impl DigestStore for FlakyStore {
    async fn fetch_items(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> StoreResult<Vec<Item>> {
        self.fetch_windows
            .lock()
            .expect("windows lock")
            .push((window_start, window_end));
        if self.fail_fetch {
            return Err(StoreError::Io(std::io::Error::other("items collection offline")));
        }
        self.inner.fetch_items(window_start, window_end).await
    }

    async fn insert_item(&self, item: Item) -> StoreResult<()> {
        self.inner.insert_item(item).await
    }

    async fn insert_digest_entry(&self, entry: DigestEntry) -> StoreResult<String> {
        if self.fail_insert_titles.contains(&entry.section.title) {
            return Err(StoreError::Io(std::io::Error::other("write rejected")));
        }
        self.inner.insert_digest_entry(entry).await
    }

    async fn get_digest_entry(&self, entry_id: &str) -> StoreResult<Option<DigestEntry>> {
        self.inner.get_digest_entry(entry_id).await
    }

    async fn latest_digest_version(&self) -> StoreResult<Option<i64>> {
        self.inner.latest_digest_version().await
    }

    async fn vector_search_digests(
        &self,
        query: &[f32],
        version: i64,
        num_candidates: usize,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        self.inner
            .vector_search_digests(query, version, num_candidates, limit)
            .await
    }

    async fn get_reader(&self, reader_id: &str) -> StoreResult<Reader> {
        self.inner.get_reader(reader_id).await
    }

    async fn upsert_reader(&self, reader: Reader) -> StoreResult<()> {
        self.inner.upsert_reader(reader).await
    }
}
