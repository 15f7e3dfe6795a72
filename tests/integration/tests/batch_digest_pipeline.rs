use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use digest_ai::{
    ChatRequest, ChatResponse, ChatUsage, DigestAiError, EmbeddingClient, EmbeddingRequest,
    EmbeddingResponse, LlmClient, Message,
};
use digest_cluster::ClusteringConfig;
use digest_pipeline::{
    BatchDigestCoordinator, CoordinatorConfig, GenerationOrchestrator, GeneratorConfig,
    LlmDigestGenerator, ManualClock, MatcherConfig, ProviderTextEmbedder, RetrievalMatcher,
};
use digest_store::{DigestStore, InMemoryDigestStore, SqliteDigestStore};
use digest_types::{BatchReport, Item};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

/// Writes one or two sections per topic, keyed off the article titles in the prompt.
struct TopicLlm {
    fail_topic: Option<&'static str>,
    broken_section: bool,
    requests: AsyncMutex<Vec<ChatRequest>>,
}

impl TopicLlm {
    fn new() -> Self {
        Self {
            fail_topic: None,
            broken_section: false,
            requests: AsyncMutex::new(Vec::new()),
        }
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl LlmClient for TopicLlm {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, DigestAiError> {
        let prompt = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.requests.lock().await.push(request);

        let topic = if prompt.contains("alpha story") {
            "Alpha"
        } else if prompt.contains("beta story") {
            "Beta"
        } else {
            return Err(DigestAiError::InvalidResponse(
                "prompt carried no known articles".to_string(),
            ));
        };
        if self.fail_topic == Some(topic) {
            return Err(DigestAiError::HttpStatus {
                status: 500,
                body: "model overloaded".to_string(),
            });
        }

        let mut sections = vec![json!({
            "title": format!("{topic} lead"),
            "category": "news",
            "highlights": ["first highlight"],
            "body": ["opening paragraph"],
            "articleLinks": ["https://example.com/1"],
        })];
        if topic == "Alpha" {
            sections.push(json!({"title": "Alpha follow-up", "category": "news"}));
            if self.broken_section {
                sections.push(json!({"title": "Alpha broken"}));
            }
        }
        Ok(ChatResponse {
            message: Message::assistant_text(json!({ "sections": sections }).to_string()),
            finish_reason: Some("stop".to_string()),
            usage: ChatUsage::default(),
        })
    }
}

/// Maps section text onto one axis per topic.
struct TopicEmbeddings;

#[async_trait]
impl EmbeddingClient for TopicEmbeddings {
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, DigestAiError> {
        let mut embeddings = Vec::with_capacity(request.input.len());
        for text in &request.input {
            if text.contains("broken") {
                return Err(DigestAiError::InvalidResponse(
                    "embedding rejected".to_string(),
                ));
            }
            let embedding = if text.starts_with("Alpha") {
                vec![1.0, 0.0, 0.0]
            } else if text.starts_with("Beta") {
                vec![0.0, 1.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            };
            embeddings.push(embedding);
        }
        Ok(EmbeddingResponse {
            embeddings,
            usage: ChatUsage::default(),
        })
    }
}

fn run_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn coordinator(
    store: Arc<dyn DigestStore>,
    llm: Arc<TopicLlm>,
    clock: Arc<ManualClock>,
) -> BatchDigestCoordinator {
    let generator = LlmDigestGenerator::new(llm, GeneratorConfig::default());
    let embedder = ProviderTextEmbedder::new(Arc::new(TopicEmbeddings), "embed-test");
    let orchestrator = GenerationOrchestrator::new(Arc::new(generator), Arc::new(embedder));
    let config = CoordinatorConfig {
        clustering: ClusteringConfig {
            reduce_dimensions: false,
            ..ClusteringConfig::default()
        },
        ..CoordinatorConfig::default()
    };
    BatchDigestCoordinator::new(store, orchestrator, config).with_clock(clock)
}

async fn seed_two_topics(store: &dyn DigestStore, created_at: DateTime<Utc>) {
    let points: [(&str, &str, [f32; 2]); 6] = [
        ("1", "alpha", [0.0, 0.0]),
        ("2", "alpha", [0.01, 0.0]),
        ("3", "alpha", [0.0, 0.01]),
        ("4", "beta", [10.0, 10.0]),
        ("5", "beta", [10.01, 10.0]),
        ("6", "beta", [10.0, 10.01]),
    ];
    for (id, topic, embedding) in points {
        let mut item = Item::new(id, Some(embedding.to_vec()), created_at);
        item.title = format!("{topic} story {id}");
        item.summary = format!("summary of {topic} story {id}");
        item.url = format!("https://example.com/{id}");
        store.insert_item(item).await.expect("seed item");
    }
}

async fn seed_topic_blobs(store: &dyn DigestStore, per_topic: usize, created_at: DateTime<Utc>) {
    for (axis, topic) in ["alpha", "beta"].into_iter().enumerate() {
        for index in 0..per_topic {
            let embedding = (0..8)
                .map(|dim| {
                    let center = if dim == axis { 10.0 } else { 0.0 };
                    let offset = ((index * 7 + dim * 3) % 11) as f32 * 0.05 - 0.25;
                    center + offset
                })
                .collect::<Vec<f32>>();
            let id = format!("{topic}-{index}");
            let mut item = Item::new(&id, Some(embedding), created_at);
            item.title = format!("{topic} story {id}");
            item.url = format!("https://example.com/{id}");
            store.insert_item(item).await.expect("seed item");
        }
    }
}

#[tokio::test]
async fn integration_default_config_reduces_clusters_and_generates_per_topic() {
    let store = Arc::new(InMemoryDigestStore::new());
    seed_topic_blobs(store.as_ref(), 20, run_time() - Duration::hours(3)).await;
    let llm = Arc::new(TopicLlm::new());
    let generator = LlmDigestGenerator::new(llm.clone(), GeneratorConfig::default());
    let embedder = ProviderTextEmbedder::new(Arc::new(TopicEmbeddings), "embed-test");
    let orchestrator = GenerationOrchestrator::new(Arc::new(generator), Arc::new(embedder));
    let coordinator =
        BatchDigestCoordinator::new(store.clone(), orchestrator, CoordinatorConfig::default())
            .with_clock(Arc::new(ManualClock::new(run_time())));

    let report = coordinator.run_batch().await.expect("batch run");

    assert_eq!(report.items_fetched, 40);
    assert_eq!(report.items_dropped, 0);
    assert_eq!(report.items_unassigned, 0);
    assert!(report.groups_total >= 2, "{report:?}");
    assert_eq!(report.groups_failed, 0);
    assert_eq!(report.entries_persist_failed, 0);
    assert_eq!(store.digest_entry_count().await, report.entries_created);

    let requests = llm.requests.lock().await;
    assert_eq!(requests.len(), report.groups_total);
    for request in requests.iter() {
        let prompt = request
            .messages
            .last()
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        assert!(
            !(prompt.contains("alpha story") && prompt.contains("beta story")),
            "group mixes topics"
        );
    }
}

#[tokio::test]
async fn integration_two_topics_produce_two_groups_and_matchable_entries() {
    let store = Arc::new(InMemoryDigestStore::new());
    seed_two_topics(store.as_ref(), run_time() - Duration::hours(1)).await;
    let llm = Arc::new(TopicLlm::new());
    let clock = Arc::new(ManualClock::new(run_time()));

    let report = coordinator(store.clone(), llm.clone(), clock)
        .run_batch()
        .await
        .expect("batch run");

    let version = run_time().timestamp_millis();
    assert_eq!(
        report,
        BatchReport {
            version,
            items_fetched: 6,
            items_dropped: 0,
            items_unassigned: 0,
            groups_total: 2,
            groups_failed: 0,
            entries_created: 3,
            entries_dropped: 0,
            entries_persist_failed: 0,
        }
    );
    assert_eq!(llm.request_count().await, 2);

    let matcher = RetrievalMatcher::new(store.clone(), MatcherConfig::default());
    let ids = matcher.match_embedding(&[1.0, 0.0, 0.0]).await.expect("match");
    assert_eq!(ids.len(), 3);
    for id in &ids[..2] {
        let entry = store
            .get_digest_entry(id)
            .await
            .expect("lookup")
            .expect("entry exists");
        assert!(entry.section.title.starts_with("Alpha"), "{id}");
        assert_eq!(entry.version, version);
    }
}

#[tokio::test]
async fn integration_failing_group_and_section_are_isolated() {
    let store = Arc::new(InMemoryDigestStore::new());
    seed_two_topics(store.as_ref(), run_time() - Duration::hours(2)).await;
    let llm = Arc::new(TopicLlm {
        fail_topic: Some("Beta"),
        broken_section: true,
        ..TopicLlm::new()
    });
    let clock = Arc::new(ManualClock::new(run_time()));

    let report = coordinator(store.clone(), llm, clock)
        .run_batch()
        .await
        .expect("partial failures are not fatal");

    assert_eq!(report.groups_total, 2);
    assert_eq!(report.groups_failed, 1);
    assert_eq!(report.entries_created, 2);
    assert_eq!(report.entries_dropped, 1);
    assert_eq!(store.digest_entry_count().await, 2);
}

#[tokio::test]
async fn integration_empty_window_writes_nothing_and_match_is_empty() {
    let store = Arc::new(InMemoryDigestStore::new());
    seed_two_topics(store.as_ref(), run_time() - Duration::hours(30)).await;
    let llm = Arc::new(TopicLlm::new());
    let clock = Arc::new(ManualClock::new(run_time()));

    let report = coordinator(store.clone(), llm.clone(), clock)
        .run_batch()
        .await
        .expect("empty run");

    assert_eq!(report, BatchReport::empty(run_time().timestamp_millis()));
    assert_eq!(llm.request_count().await, 0);
    assert_eq!(store.digest_entry_count().await, 0);

    let matcher = RetrievalMatcher::new(store, MatcherConfig::default());
    let ids = matcher.match_embedding(&[1.0, 0.0, 0.0]).await.expect("match");
    assert!(ids.is_empty());
}

#[tokio::test]
async fn integration_matcher_only_sees_the_newest_version() {
    let store = Arc::new(InMemoryDigestStore::new());
    seed_two_topics(store.as_ref(), run_time() - Duration::hours(1)).await;
    let clock = Arc::new(ManualClock::new(run_time()));
    let coordinator = coordinator(store.clone(), Arc::new(TopicLlm::new()), clock.clone());

    let first = coordinator.run_batch().await.expect("first run");
    clock.advance(Duration::hours(1));
    let second = coordinator.run_batch().await.expect("second run");
    assert!(second.version > first.version);
    assert_eq!(store.digest_entry_count().await, 6);

    let matcher = RetrievalMatcher::new(store, MatcherConfig::default());
    let ids = matcher.match_embedding(&[0.0, 1.0, 0.0]).await.expect("match");
    assert_eq!(ids.len(), 3);
    let prefix = format!("{}-", second.version);
    assert!(ids.iter().all(|id| id.starts_with(&prefix)), "{ids:?}");
}

#[tokio::test]
async fn integration_sqlite_store_persists_a_full_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("digest.sqlite3");
    let store = Arc::new(SqliteDigestStore::new(&db_path).expect("sqlite store"));
    seed_two_topics(store.as_ref(), run_time() - Duration::minutes(5)).await;
    let clock = Arc::new(ManualClock::new(run_time()));

    let report = coordinator(store.clone(), Arc::new(TopicLlm::new()), clock)
        .run_batch()
        .await
        .expect("batch run");
    assert_eq!(report.entries_created, 3);
    drop(store);

    let reopened: Arc<dyn DigestStore> =
        Arc::new(SqliteDigestStore::new(&db_path).expect("reopen"));
    assert_eq!(
        reopened.latest_digest_version().await.expect("latest"),
        Some(report.version)
    );
    let matcher = RetrievalMatcher::new(reopened.clone(), MatcherConfig::default());
    let ids = matcher.match_embedding(&[0.0, 1.0, 0.0]).await.expect("match");
    let best = reopened
        .get_digest_entry(&ids[0])
        .await
        .expect("lookup")
        .expect("entry exists");
    assert_eq!(best.section.title, "Beta lead");
    assert_eq!(best.section.highlights, vec!["first highlight".to_string()]);
    assert_eq!(best.version, report.version);
}
