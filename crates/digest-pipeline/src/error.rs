use digest_ai::DigestAiError;
use digest_cluster::ClusteringError;
use digest_store::StoreError;
use digest_types::GroupLabel;
use thiserror::Error;

/// Failure of the synthesis call for a whole group.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("digest prompt failed to render: {0}")]
    Template(#[from] minijinja::Error),
    #[error("generation provider failed: {0}")]
    Provider(#[from] DigestAiError),
    #[error("generation response is malformed: {0}")]
    MalformedResponse(String),
}

/// Failure to embed one digest section.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("section embedding text failed to render: {0}")]
    Template(#[from] minijinja::Error),
    #[error("embedding provider failed: {0}")]
    Provider(#[from] DigestAiError),
    #[error("embedding provider returned an empty vector")]
    EmptyVector,
}

/// A group whose generation failed; sibling groups are unaffected.
#[derive(Debug, Error)]
#[error("digest generation for group {group} (version {version}) failed: {cause}")]
pub struct GroupFailure {
    pub group: GroupLabel,
    pub version: i64,
    #[source]
    pub cause: GenerationError,
}

/// Errors that abort a batch run before anything is generated.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to fetch batch items: {0}")]
    Fetch(#[source] StoreError),
    #[error("failed to cluster batch items: {0}")]
    Clustering(#[from] ClusteringError),
    #[error("clustering task failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("reader '{0}' not found")]
    ReaderNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MatchError {
    pub fn is_reader_not_found(&self) -> bool {
        matches!(self, Self::ReaderNotFound(_))
    }
}
