use std::collections::BTreeMap;
use std::sync::Arc;

use digest_types::{DigestEntry, DigestSection, GroupLabel, GroupProjection, GroupedItem};
use futures_util::future::join_all;

use crate::generation::{DigestGenerator, PromptTemplates, TextEmbedder};
use crate::{EmbeddingError, GroupFailure};

/// Entries produced for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutput {
    pub group: GroupLabel,
    /// In synthesis order, minus sections whose embedding failed.
    pub entries: Vec<DigestEntry>,
    pub entries_dropped: usize,
}

/// Aggregate outcome of generating every group of a batch.
#[derive(Debug, Default)]
pub struct BatchGeneration {
    pub entries: Vec<DigestEntry>,
    pub groups_total: usize,
    pub groups_failed: usize,
    pub entries_dropped: usize,
    /// Noise items that were not sent for generation.
    pub items_unassigned: usize,
    pub failures: Vec<GroupFailure>,
}

/// Fans digest generation out across groups and isolates their failures.
pub struct GenerationOrchestrator {
    generator: Arc<dyn DigestGenerator>,
    embedder: Arc<dyn TextEmbedder>,
    templates: PromptTemplates,
}

impl GenerationOrchestrator {
    pub fn new(generator: Arc<dyn DigestGenerator>, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            generator,
            embedder,
            templates: PromptTemplates::default(),
        }
    }

    /// Overrides the template used to build section embedding text.
    pub fn with_templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = templates;
        self
    }

    /// Synthesizes and embeds the digest sections of one group.
    ///
    /// The group label is taken from the first item. A failed synthesis call
    /// fails the whole group; a failed embedding only drops its section.
    pub async fn generate_for_group(
        &self,
        group_items: &[GroupedItem],
        version: i64,
    ) -> Result<GroupOutput, GroupFailure> {
        let Some(first) = group_items.first() else {
            return Ok(GroupOutput {
                group: GroupLabel::Noise,
                entries: Vec::new(),
                entries_dropped: 0,
            });
        };
        let group = first.group;
        let projection = GroupProjection {
            group_label: group.to_string(),
            version,
            articles: group_items
                .iter()
                .map(|grouped| grouped.item.projection())
                .collect(),
        };
        tracing::info!(%group, version, articles = group_items.len(), "creating group digest");

        let sections = self
            .generator
            .synthesize(&projection)
            .await
            .map_err(|cause| GroupFailure {
                group,
                version,
                cause,
            })?;

        let embeddings = join_all(sections.iter().map(|section| self.embed_section(section))).await;
        let mut entries = Vec::with_capacity(sections.len());
        let mut entries_dropped = 0;
        for (section, embedding) in sections.into_iter().zip(embeddings) {
            match embedding {
                Ok(embedding) => entries.push(DigestEntry::new(section, embedding, group, version)),
                Err(error) => {
                    entries_dropped += 1;
                    tracing::warn!(
                        %group,
                        version,
                        title = %section.title,
                        error = %error,
                        "dropping digest section after embedding failure"
                    );
                }
            }
        }

        tracing::info!(
            %group,
            version,
            entries = entries.len(),
            entries_dropped,
            "finished group digest"
        );
        Ok(GroupOutput {
            group,
            entries,
            entries_dropped,
        })
    }

    /// Generates every non-noise group of `grouped_items` concurrently.
    pub async fn generate_for_batch(
        &self,
        grouped_items: &[GroupedItem],
        version: i64,
    ) -> BatchGeneration {
        let mut groups = BTreeMap::<GroupLabel, Vec<GroupedItem>>::new();
        let mut items_unassigned = 0;
        for grouped in grouped_items {
            if grouped.group.is_noise() {
                items_unassigned += 1;
                continue;
            }
            groups.entry(grouped.group).or_default().push(grouped.clone());
        }

        let results = join_all(
            groups
                .values()
                .map(|members| self.generate_for_group(members, version)),
        )
        .await;

        let mut generation = BatchGeneration {
            groups_total: groups.len(),
            items_unassigned,
            ..BatchGeneration::default()
        };
        for result in results {
            match result {
                Ok(output) => {
                    generation.entries_dropped += output.entries_dropped;
                    generation.entries.extend(output.entries);
                }
                Err(failure) => {
                    tracing::warn!(
                        group = %failure.group,
                        version = failure.version,
                        error = %failure.cause,
                        "group digest failed"
                    );
                    generation.groups_failed += 1;
                    generation.failures.push(failure);
                }
            }
        }
        generation
    }

    async fn embed_section(&self, section: &DigestSection) -> Result<Vec<f32>, EmbeddingError> {
        let text = self.templates.render_section_text(section)?;
        let embedding = self.embedder.embed(&text).await?;
        if embedding.is_empty() {
            return Err(EmbeddingError::EmptyVector);
        }
        Ok(embedding)
    }
}
