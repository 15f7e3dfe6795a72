//! OpenAI-compatible chat and embedding clients used by digest generation.
mod embeddings;
mod openai;
mod retry;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use retry::RetryPolicy;
pub use types::{
    ChatRequest, ChatResponse, ChatUsage, DigestAiError, EmbeddingClient, EmbeddingRequest,
    EmbeddingResponse, LlmClient, Message, MessageRole,
};
