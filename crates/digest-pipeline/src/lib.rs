//! Batch digest pipeline: per-group generation fan-out, the batch
//! coordinator, and latest-version retrieval.

mod coordinator;
mod error;
mod generation;
mod matcher;
mod orchestrator;
#[cfg(test)]
mod test_support;

pub use coordinator::{BatchDigestCoordinator, Clock, CoordinatorConfig, ManualClock, SystemClock};
pub use error::{BatchError, EmbeddingError, GenerationError, GroupFailure, MatchError};
pub use generation::{
    parse_sections, DigestGenerator, GeneratorConfig, LlmDigestGenerator, PromptTemplates,
    ProviderTextEmbedder, TextEmbedder, DIGEST_SYSTEM_TEMPLATE_FILE, DIGEST_USER_TEMPLATE_FILE,
    SECTION_EMBEDDING_TEMPLATE_FILE,
};
pub use matcher::{MatcherConfig, RetrievalMatcher};
pub use orchestrator::{BatchGeneration, GenerationOrchestrator, GroupOutput};
