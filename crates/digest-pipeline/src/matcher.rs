use std::sync::Arc;

use digest_store::{DigestStore, StoreError};

use crate::MatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherConfig {
    /// Candidate pool size for the vector search.
    pub num_candidates: usize,
    pub limit: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            num_candidates: 400,
            limit: 100,
        }
    }
}

/// Matches readers against the entries of the latest digest version.
pub struct RetrievalMatcher {
    store: Arc<dyn DigestStore>,
    config: MatcherConfig,
}

impl RetrievalMatcher {
    pub fn new(store: Arc<dyn DigestStore>, config: MatcherConfig) -> Self {
        Self { store, config }
    }

    /// Entry ids of the latest version, most similar first. Empty when nothing is stored.
    pub async fn match_embedding(
        &self,
        reader_embedding: &[f32],
    ) -> Result<Vec<String>, MatchError> {
        let Some(version) = self.store.latest_digest_version().await? else {
            tracing::debug!("no digest entries stored yet");
            return Ok(Vec::new());
        };
        let ids = self
            .store
            .vector_search_digests(
                reader_embedding,
                version,
                self.config.num_candidates,
                self.config.limit,
            )
            .await?;
        tracing::debug!(version, matches = ids.len(), "matched digest entries");
        Ok(ids)
    }

    pub async fn match_reader(&self, reader_id: &str) -> Result<Vec<String>, MatchError> {
        let reader = self
            .store
            .get_reader(reader_id)
            .await
            .map_err(|error| match error {
                StoreError::NotFound { .. } => MatchError::ReaderNotFound(reader_id.to_string()),
                other => MatchError::Store(other),
            })?;
        self.match_embedding(&reader.embedding).await
    }
}

#[cfg(test)]
mod tests {
    use super::{MatcherConfig, RetrievalMatcher};
    use crate::MatchError;
    use digest_store::{DigestStore, InMemoryDigestStore};
    use digest_types::{DigestEntry, DigestSection, GroupLabel, Reader};
    use std::sync::Arc;

    async fn store_entry(
        store: &InMemoryDigestStore,
        title: &str,
        embedding: &[f32],
        version: i64,
    ) -> String {
        store
            .insert_digest_entry(DigestEntry::new(
                DigestSection::titled(title),
                embedding.to_vec(),
                GroupLabel::Group(0),
                version,
            ))
            .await
            .expect("insert entry")
    }

    #[tokio::test]
    async fn spec_c08_no_entries_yields_empty_match() {
        let matcher = RetrievalMatcher::new(
            Arc::new(InMemoryDigestStore::new()),
            MatcherConfig::default(),
        );
        let ids = matcher.match_embedding(&[1.0, 0.0]).await.expect("match");
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn spec_c09_only_latest_version_entries_are_returned() {
        let store = Arc::new(InMemoryDigestStore::new());
        let old_best = store_entry(&store, "old exact", &[1.0, 0.0], 100).await;
        let new_far = store_entry(&store, "new far", &[0.0, 1.0], 200).await;
        let new_near = store_entry(&store, "new near", &[0.9, 0.1], 200).await;

        let matcher = RetrievalMatcher::new(store, MatcherConfig::default());
        let ids = matcher.match_embedding(&[1.0, 0.0]).await.expect("match");

        assert_eq!(ids, vec![new_near, new_far]);
        assert!(!ids.contains(&old_best));
    }

    #[tokio::test]
    async fn functional_limit_caps_the_result() {
        let store = Arc::new(InMemoryDigestStore::new());
        for index in 0..5 {
            store_entry(&store, &format!("entry {index}"), &[1.0, index as f32], 7).await;
        }
        let matcher = RetrievalMatcher::new(
            store,
            MatcherConfig {
                num_candidates: 4,
                limit: 2,
            },
        );
        assert_eq!(matcher.match_embedding(&[1.0, 0.0]).await.expect("match").len(), 2);
    }

    #[tokio::test]
    async fn regression_unknown_reader_is_distinct_from_store_failures() {
        let store = Arc::new(InMemoryDigestStore::new());
        store
            .upsert_reader(Reader {
                id: "reader-1".to_string(),
                embedding: vec![0.0, 1.0],
            })
            .await
            .expect("upsert reader");
        let far = store_entry(&store, "far", &[1.0, 0.0], 3).await;
        let near = store_entry(&store, "near", &[0.1, 1.0], 3).await;
        let matcher = RetrievalMatcher::new(store, MatcherConfig::default());

        assert_eq!(matcher.match_reader("reader-1").await.expect("match"), vec![near, far]);

        let error = matcher.match_reader("ghost").await.expect_err("unknown reader");
        assert!(error.is_reader_not_found());
        assert!(matches!(error, MatchError::ReaderNotFound(id) if id == "ghost"));
    }
}
