use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::{
    retry::{is_retryable_status, is_transient_transport_error, next_request_id, retry_after_ms},
    ChatRequest, ChatResponse, ChatUsage, DigestAiError, LlmClient, Message, MessageRole,
    RetryPolicy,
};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl OpenAiConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            organization: None,
            request_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Client for OpenAI-compatible `/chat/completions` and `/embeddings` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, DigestAiError> {
        if config.api_key.trim().is_empty() {
            return Err(DigestAiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|e| {
                DigestAiError::InvalidResponse(format!("invalid API key header: {e}"))
            })?,
        );
        if let Some(org) = &config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org).map_err(|e| {
                    DigestAiError::InvalidResponse(format!("invalid organization header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    pub(crate) fn endpoint_url(&self, endpoint: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with(endpoint) {
            return base.to_string();
        }
        format!("{base}{endpoint}")
    }

    /// POSTs `body` to `url`, retrying transient failures, and returns the raw success body.
    pub(crate) async fn post_json_with_retry(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<String, DigestAiError> {
        let started = std::time::Instant::now();
        let policy = self.config.retry;

        for attempt in 0..=policy.max_retries {
            let request_id = next_request_id();
            let response = self
                .client
                .post(url)
                .header("x-digest-request-id", request_id.as_str())
                .header("x-digest-retry-attempt", attempt.to_string())
                .json(body)
                .send()
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    let retry_after = retry_after_ms(response.headers());
                    let raw = response.text().await?;
                    if is_retryable_status(status) {
                        if let Some(delay_ms) =
                            policy.delay_before_retry(attempt, elapsed_ms, retry_after)
                        {
                            tracing::warn!(
                                %request_id,
                                status = status.as_u16(),
                                attempt,
                                delay_ms,
                                "retrying provider request"
                            );
                            sleep(std::time::Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }

                    return Err(DigestAiError::HttpStatus {
                        status: status.as_u16(),
                        body: raw,
                    });
                }
                Err(error) => {
                    if is_transient_transport_error(&error) {
                        if let Some(delay_ms) = policy.delay_before_retry(attempt, elapsed_ms, None)
                        {
                            tracing::warn!(
                                %request_id,
                                attempt,
                                delay_ms,
                                error = %error,
                                "retrying provider request after transport error"
                            );
                            sleep(std::time::Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }
                    return Err(DigestAiError::Http(error));
                }
            }
        }

        Err(DigestAiError::InvalidResponse(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, DigestAiError> {
        let body = build_chat_request_body(&request);
        let url = self.endpoint_url("/chat/completions");
        let raw = self.post_json_with_retry(&url, &body).await?;
        parse_chat_response(&raw)
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn build_chat_request_body(request: &ChatRequest) -> Value {
    let messages = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": role_name(message.role),
                "content": message.content,
            })
        })
        .collect::<Vec<_>>();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if request.json_mode {
        body["response_format"] = json!({
            "type": "json_object",
        });
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiUsage {
    #[serde(default)]
    pub(crate) prompt_tokens: u64,
    #[serde(default)]
    pub(crate) completion_tokens: u64,
    #[serde(default)]
    pub(crate) total_tokens: u64,
}

impl From<OpenAiUsage> for ChatUsage {
    fn from(usage: OpenAiUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_chat_response(raw: &str) -> Result<ChatResponse, DigestAiError> {
    let parsed: OpenAiChatResponse = serde_json::from_str(raw)?;
    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        DigestAiError::InvalidResponse("response contained no choices".to_string())
    })?;

    Ok(ChatResponse {
        message: Message::assistant_text(content_text(&choice.message.content)),
        finish_reason: choice.finish_reason,
        usage: parsed.usage.map(ChatUsage::from).unwrap_or_default(),
    })
}
