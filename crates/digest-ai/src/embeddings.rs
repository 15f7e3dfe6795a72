use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::openai::{OpenAiClient, OpenAiUsage};
use crate::{ChatUsage, DigestAiError, EmbeddingClient, EmbeddingRequest, EmbeddingResponse};

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiClient {
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, DigestAiError> {
        if request.input.is_empty() {
            return Ok(EmbeddingResponse {
                embeddings: Vec::new(),
                usage: ChatUsage::default(),
            });
        }

        let body = build_embedding_request_body(&request);
        let url = self.endpoint_url("/embeddings");
        let raw = self.post_json_with_retry(&url, &body).await?;
        parse_embedding_response(&raw, request.input.len())
    }
}

fn build_embedding_request_body(request: &EmbeddingRequest) -> Value {
    json!({
        "model": request.model,
        "input": request.input,
    })
}

fn parse_embedding_response(
    raw: &str,
    expected: usize,
) -> Result<EmbeddingResponse, DigestAiError> {
    let parsed: OpenAiEmbeddingResponse = serde_json::from_str(raw)?;
    if parsed.data.len() != expected {
        return Err(DigestAiError::InvalidResponse(format!(
            "embedding response size mismatch: expected {expected}, got {}",
            parsed.data.len()
        )));
    }

    let mut data = parsed.data;
    if data.iter().all(|item| item.index.is_some()) {
        data.sort_by_key(|item| item.index);
    }
    if let Some(empty) = data.iter().position(|item| item.embedding.is_empty()) {
        return Err(DigestAiError::InvalidResponse(format!(
            "embedding at position {empty} is empty"
        )));
    }

    Ok(EmbeddingResponse {
        embeddings: data.into_iter().map(|item| item.embedding).collect(),
        usage: parsed.usage.map(ChatUsage::from).unwrap_or_default(),
    })
}
