use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_finite_f32(value: &str) -> Result<f32, String> {
    let parsed = value
        .trim()
        .parse::<f32>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() {
        return Err("value must be a finite number".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "digest",
    about = "Batch topical clustering and digest generation",
    version
)]
pub struct Cli {
    #[arg(
        long = "db-path",
        env = "DIGEST_DB_PATH",
        default_value = ".digest/digest.sqlite3",
        global = true,
        help = "SQLite database holding items, readers and digest entries"
    )]
    pub db_path: PathBuf,

    #[arg(
        long = "config",
        env = "DIGEST_CONFIG",
        global = true,
        help = "Optional TOML file with clustering, generation, batch and matcher settings"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: DigestCommand,
}

#[derive(Debug, Subcommand)]
pub enum DigestCommand {
    /// Create the database schema.
    InitDb,
    /// Load items (and optionally readers) from JSON or JSON Lines files.
    ImportItems(ImportItemsArgs),
    /// Cluster the trailing window of items and generate a new digest version.
    RunBatch(RunBatchArgs),
    /// Match an embedding against the latest digest version.
    Match(MatchArgs),
    /// Match a stored reader against the latest digest version.
    MatchReader(MatchReaderArgs),
}

#[derive(Debug, Args)]
pub struct ImportItemsArgs {
    #[arg(help = "JSON array or JSON Lines file of items")]
    pub items: PathBuf,

    #[arg(long = "readers", help = "Optional JSON array or JSON Lines file of readers")]
    pub readers: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProviderArgs {
    #[arg(
        long = "api-base",
        env = "DIGEST_OPENAI_API_BASE",
        default_value = "https://api.openai.com/v1",
        help = "Base URL for OpenAI-compatible chat and embedding APIs"
    )]
    pub api_base: String,

    #[arg(
        long = "api-key",
        env = "DIGEST_OPENAI_API_KEY",
        hide_env_values = true,
        help = "API key for the OpenAI-compatible provider"
    )]
    pub api_key: Option<String>,

    #[arg(
        long = "chat-model",
        env = "DIGEST_CHAT_MODEL",
        help = "Chat model used to synthesize digest sections"
    )]
    pub chat_model: Option<String>,

    #[arg(
        long = "embedding-model",
        env = "DIGEST_EMBEDDING_MODEL",
        help = "Embedding model used for digest sections"
    )]
    pub embedding_model: Option<String>,

    #[arg(
        long = "request-timeout-ms",
        env = "DIGEST_REQUEST_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "Per-request timeout for provider calls"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "max-retries",
        env = "DIGEST_MAX_RETRIES",
        default_value_t = 2,
        help = "Retries for throttled or failed provider requests"
    )]
    pub max_retries: usize,
}

#[derive(Debug, Args)]
pub struct RunBatchArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,

    #[arg(
        long = "templates-dir",
        env = "DIGEST_TEMPLATES_DIR",
        help = "Directory with digest_system.j2, digest_user.j2 and section_embedding.j2 overrides"
    )]
    pub templates_dir: Option<PathBuf>,

    #[arg(
        long = "window-hours",
        value_parser = parse_positive_u64,
        help = "Trailing window of items to cluster (default 24)"
    )]
    pub window_hours: Option<u64>,
}

#[derive(Debug, Args)]
pub struct MatchLimitArgs {
    #[arg(
        long = "num-candidates",
        value_parser = parse_positive_usize,
        help = "Candidate pool for the vector search (default 400)"
    )]
    pub num_candidates: Option<usize>,

    #[arg(
        long = "limit",
        value_parser = parse_positive_usize,
        help = "Maximum number of entry ids returned (default 100)"
    )]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct MatchArgs {
    #[arg(
        long = "embedding",
        value_delimiter = ',',
        required = true,
        allow_negative_numbers = true,
        value_parser = parse_finite_f32,
        help = "Comma-separated reader embedding"
    )]
    pub embedding: Vec<f32>,

    #[command(flatten)]
    pub limits: MatchLimitArgs,
}

#[derive(Debug, Args)]
pub struct MatchReaderArgs {
    pub reader_id: String,

    #[command(flatten)]
    pub limits: MatchLimitArgs,
}
