//! Generation and embedding collaborators, plus the provider-backed adapters.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use digest_ai::{ChatRequest, EmbeddingClient, EmbeddingRequest, LlmClient, Message};
use digest_types::{DigestSection, GroupProjection};
use minijinja::{context, Environment};
use serde_json::Value;

use crate::{EmbeddingError, GenerationError};

pub const DIGEST_SYSTEM_TEMPLATE_FILE: &str = "digest_system.j2";
pub const DIGEST_USER_TEMPLATE_FILE: &str = "digest_user.j2";
pub const SECTION_EMBEDDING_TEMPLATE_FILE: &str = "section_embedding.j2";

/// Synthesizes digest sections for one group.
#[async_trait]
pub trait DigestGenerator: Send + Sync {
    async fn synthesize(
        &self,
        projection: &GroupProjection,
    ) -> Result<Vec<DigestSection>, GenerationError>;
}

/// Computes the embedding vector for a piece of text.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Prompt templates used for synthesis and for section embedding text.
///
/// Templates are rendered with minijinja. The user prompt receives
/// `cluster_articles` (the group projection as JSON), `group_label`,
/// `version` and `article_count`; the embedding template receives the
/// section's own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub digest_system: String,
    pub digest_user: String,
    pub section_embedding: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            digest_system: concat!(
                "You write sections of a daily news digest. ",
                "Respond with a single JSON object of the form {\"sections\": [...]}. ",
                "Each section has category, title, teaser, highlights (list of strings), ",
                "body (list of paragraphs), articleLinks, imageUrl, readTime (minutes) and mood."
            )
            .to_string(),
            digest_user: concat!(
                "Group {{ group_label }} of digest version {{ version }} ",
                "contains {{ article_count }} related articles:\n",
                "{{ cluster_articles }}\n\n",
                "Write one or more digest sections covering these articles. ",
                "List every article you draw on in articleLinks and pick imageUrl ",
                "from the article images when one fits."
            )
            .to_string(),
            section_embedding: concat!(
                "{{ title }}\n",
                "{{ teaser }}\n",
                "Category: {{ category }}\n",
                "Mood: {{ mood }}\n",
                "{% for highlight in highlights %}- {{ highlight }}\n{% endfor %}",
                "{{ body | join(\"\\n\") }}"
            )
            .to_string(),
        }
    }
}

impl PromptTemplates {
    /// Loads templates from `dir`, keeping the built-in default for any file that is absent.
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut templates = Self::default();
        let slots = [
            (DIGEST_SYSTEM_TEMPLATE_FILE, &mut templates.digest_system),
            (DIGEST_USER_TEMPLATE_FILE, &mut templates.digest_user),
            (SECTION_EMBEDDING_TEMPLATE_FILE, &mut templates.section_embedding),
        ];
        for (file_name, slot) in slots {
            match std::fs::read_to_string(dir.join(file_name)) {
                Ok(raw) => *slot = raw,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
        Ok(templates)
    }

    pub fn render_digest_user(
        &self,
        projection: &GroupProjection,
    ) -> Result<String, GenerationError> {
        let cluster_articles = serde_json::to_string_pretty(&projection.articles)
            .map_err(|error| GenerationError::MalformedResponse(error.to_string()))?;
        let rendered = Environment::new().render_str(
            &self.digest_user,
            context! {
                cluster_articles => cluster_articles,
                group_label => projection.group_label.as_str(),
                version => projection.version,
                article_count => projection.articles.len(),
            },
        )?;
        Ok(rendered)
    }

    pub fn render_section_text(&self, section: &DigestSection) -> Result<String, EmbeddingError> {
        let rendered = Environment::new().render_str(&self.section_embedding, section)?;
        Ok(rendered)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.3),
            max_tokens: Some(4_096),
        }
    }
}

/// `DigestGenerator` backed by a chat-completions model in JSON mode.
pub struct LlmDigestGenerator {
    client: Arc<dyn LlmClient>,
    config: GeneratorConfig,
    templates: PromptTemplates,
}

impl LlmDigestGenerator {
    pub fn new(client: Arc<dyn LlmClient>, config: GeneratorConfig) -> Self {
        Self {
            client,
            config,
            templates: PromptTemplates::default(),
        }
    }

    pub fn with_templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = templates;
        self
    }
}

#[async_trait]
impl DigestGenerator for LlmDigestGenerator {
    async fn synthesize(
        &self,
        projection: &GroupProjection,
    ) -> Result<Vec<DigestSection>, GenerationError> {
        let user = self.templates.render_digest_user(projection)?;
        let response = self
            .client
            .complete(ChatRequest {
                model: self.config.model.clone(),
                messages: vec![
                    Message::system(self.templates.digest_system.clone()),
                    Message::user(user),
                ],
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                json_mode: true,
            })
            .await?;
        if response.finish_reason.as_deref() == Some("length") {
            tracing::warn!(
                group = %projection.group_label,
                version = projection.version,
                "digest completion hit the token limit"
            );
        }
        parse_sections(&response.message.content)
    }
}

/// Parses a `{"sections": [...]}` object, or a bare section array, from model output.
pub fn parse_sections(raw: &str) -> Result<Vec<DigestSection>, GenerationError> {
    let payload = strip_code_fence(raw.trim());
    let value: Value = serde_json::from_str(payload).map_err(|error| {
        GenerationError::MalformedResponse(format!("response is not JSON: {error}"))
    })?;
    let sections = match value {
        array @ Value::Array(_) => array,
        Value::Object(mut object) => object.remove("sections").ok_or_else(|| {
            GenerationError::MalformedResponse(
                "response object has no 'sections' field".to_string(),
            )
        })?,
        other => {
            return Err(GenerationError::MalformedResponse(format!(
                "expected an object or array, got {other}"
            )))
        }
    };
    serde_json::from_value(sections).map_err(|error| {
        GenerationError::MalformedResponse(format!(
            "sections do not match the digest shape: {error}"
        ))
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// `TextEmbedder` backed by an embeddings endpoint.
pub struct ProviderTextEmbedder {
    client: Arc<dyn EmbeddingClient>,
    model: String,
}

impl ProviderTextEmbedder {
    pub fn new(client: Arc<dyn EmbeddingClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl TextEmbedder for ProviderTextEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                input: vec![text.to_string()],
            })
            .await?;
        response
            .embeddings
            .into_iter()
            .next()
            .filter(|embedding| !embedding.is_empty())
            .ok_or(EmbeddingError::EmptyVector)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_sections, DigestGenerator, GeneratorConfig, LlmDigestGenerator, PromptTemplates,
        ProviderTextEmbedder, TextEmbedder, DIGEST_USER_TEMPLATE_FILE,
    };
    use crate::{EmbeddingError, GenerationError};
    use async_trait::async_trait;
    use digest_ai::{
        ChatRequest, ChatResponse, ChatUsage, DigestAiError, EmbeddingClient, EmbeddingRequest,
        EmbeddingResponse, LlmClient, Message, MessageRole,
    };
    use digest_types::{DigestSection, GroupProjection, ItemProjection};
    use std::sync::{Arc, Mutex};

    struct ScriptedLlm {
        reply: Result<String, u16>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        fn replying(content: &str) -> Self {
            Self {
                reply: Ok(content.to_string()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, DigestAiError> {
            self.requests.lock().expect("requests lock").push(request);
            match &self.reply {
                Ok(content) => Ok(ChatResponse {
                    message: Message::assistant_text(content.clone()),
                    finish_reason: Some("stop".to_string()),
                    usage: ChatUsage::default(),
                }),
                Err(status) => Err(DigestAiError::HttpStatus {
                    status: *status,
                    body: "unavailable".to_string(),
                }),
            }
        }
    }

    struct FixedEmbeddings(Vec<Vec<f32>>);

    #[async_trait]
    impl EmbeddingClient for FixedEmbeddings {
        async fn embed(
            &self,
            request: EmbeddingRequest,
        ) -> Result<EmbeddingResponse, DigestAiError> {
            assert_eq!(request.input.len(), 1);
            Ok(EmbeddingResponse {
                embeddings: self.0.clone(),
                usage: ChatUsage::default(),
            })
        }
    }

    fn projection() -> GroupProjection {
        GroupProjection {
            group_label: "4".to_string(),
            version: 1_700_000_000_000,
            articles: vec![ItemProjection {
                title: "Central bank holds rates".to_string(),
                summary: "Policy unchanged for a third month.".to_string(),
                url: "https://example.com/rates".to_string(),
                image: None,
            }],
        }
    }

    #[test]
    fn unit_digest_user_prompt_embeds_articles_as_json() {
        let rendered = PromptTemplates::default()
            .render_digest_user(&projection())
            .expect("render");
        assert!(rendered.starts_with("Group 4 of digest version 1700000000000 contains 1"));
        assert!(rendered.contains("\"title\": \"Central bank holds rates\""));
        assert!(rendered.contains("\"url\": \"https://example.com/rates\""));
    }

    #[test]
    fn unit_section_text_lists_highlights_and_body() {
        let section = DigestSection {
            category: "economy".to_string(),
            title: "Rates".to_string(),
            teaser: "Holding pattern".to_string(),
            highlights: vec!["a".to_string(), "b".to_string()],
            body: vec!["p1".to_string(), "p2".to_string()],
            ..DigestSection::default()
        };
        let text = PromptTemplates::default()
            .render_section_text(&section)
            .expect("render");
        assert!(text.starts_with("Rates\nHolding pattern\nCategory: economy\nMood: neutral\n"));
        assert!(text.contains("- a\n- b\n"));
        assert!(text.ends_with("p1\np2"));
    }

    #[test]
    fn regression_broken_template_is_a_template_error() {
        let templates = PromptTemplates {
            section_embedding: "{% for x in %}".to_string(),
            ..PromptTemplates::default()
        };
        let error = templates
            .render_section_text(&DigestSection::titled("x"))
            .expect_err("syntax error");
        assert!(matches!(error, EmbeddingError::Template(_)));
    }

    #[test]
    fn functional_templates_load_from_dir_with_defaults_for_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(DIGEST_USER_TEMPLATE_FILE),
            "Articles: {{ cluster_articles }}",
        )
        .expect("write template");

        let templates = PromptTemplates::from_dir(dir.path()).expect("load");
        let defaults = PromptTemplates::default();
        assert_eq!(templates.digest_user, "Articles: {{ cluster_articles }}");
        assert_eq!(templates.digest_system, defaults.digest_system);
        assert_eq!(templates.section_embedding, defaults.section_embedding);
    }

    #[test]
    fn functional_parse_sections_accepts_object_array_and_fenced_payloads() {
        let sections = parse_sections(r#"{"sections":[{"title":"A"},{"title":"B","readTime":3}]}"#)
            .expect("object");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].read_time, 3);

        let sections = parse_sections(r#"[{"title":"Only"}]"#).expect("array");
        assert_eq!(sections[0].title, "Only");

        let fenced = "```json\n{\"sections\":[{\"title\":\"Fenced\"}]}\n```";
        let sections = parse_sections(fenced).expect("fenced");
        assert_eq!(sections[0].title, "Fenced");
    }

    #[test]
    fn regression_parse_sections_rejects_malformed_payloads() {
        for raw in ["not json", r#"{"digest":[]}"#, "42", r#"{"sections":"nope"}"#] {
            let error = parse_sections(raw).expect_err(raw);
            assert!(matches!(error, GenerationError::MalformedResponse(_)), "{raw}");
        }
    }

    #[tokio::test]
    async fn functional_llm_generator_requests_json_mode_with_rendered_prompt() {
        let client = Arc::new(ScriptedLlm::replying(
            r#"{"sections":[{"title":"Rates hold","category":"economy"}]}"#,
        ));
        let generator = LlmDigestGenerator::new(
            client.clone(),
            GeneratorConfig {
                model: "digest-model".to_string(),
                temperature: Some(0.1),
                max_tokens: Some(256),
            },
        );

        let sections = generator.synthesize(&projection()).await.expect("synthesize");
        assert_eq!(sections, vec![DigestSection {
            category: "economy".to_string(),
            ..DigestSection::titled("Rates hold")
        }]);

        let requests = client.requests.lock().expect("requests lock");
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.json_mode);
        assert_eq!(request.model, "digest-model");
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert!(request.messages[1].content.contains("Central bank holds rates"));
    }

    #[tokio::test]
    async fn regression_llm_provider_errors_surface_as_generation_errors() {
        let client = Arc::new(ScriptedLlm {
            reply: Err(503),
            requests: Mutex::new(Vec::new()),
        });
        let generator = LlmDigestGenerator::new(client, GeneratorConfig::default());
        let error = generator.synthesize(&projection()).await.expect_err("provider down");
        assert!(matches!(
            error,
            GenerationError::Provider(DigestAiError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn unit_provider_embedder_returns_first_vector_and_rejects_empty() {
        let embedder = ProviderTextEmbedder::new(
            Arc::new(FixedEmbeddings(vec![vec![0.25, 0.75]])),
            "embed-model",
        );
        assert_eq!(embedder.embed("text").await.expect("embed"), vec![0.25, 0.75]);

        let embedder =
            ProviderTextEmbedder::new(Arc::new(FixedEmbeddings(Vec::new())), "embed-model");
        let error = embedder.embed("text").await.expect_err("no vectors");
        assert!(matches!(error, EmbeddingError::EmptyVector));
    }
}
