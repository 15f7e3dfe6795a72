use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use digest_ai::{OpenAiClient, OpenAiConfig, RetryPolicy};
use digest_pipeline::{
    BatchDigestCoordinator, GenerationOrchestrator, LlmDigestGenerator, MatchError,
    PromptTemplates, ProviderTextEmbedder, RetrievalMatcher,
};
use digest_store::{DigestStore, SqliteDigestStore};
use digest_types::{BatchReport, Item, Reader};
use serde::de::DeserializeOwned;

use crate::cli_args::{Cli, DigestCommand, ImportItemsArgs, MatchReaderArgs, RunBatchArgs};
use crate::config::{load_config, DigestFileConfig};

pub async fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(
        SqliteDigestStore::new(&cli.db_path)
            .with_context(|| format!("failed to open store {}", cli.db_path.display()))?,
    );

    match cli.command {
        DigestCommand::InitDb => {
            println!("initialized digest store at {}", store.db_path().display());
        }
        DigestCommand::ImportItems(args) => {
            let (items, readers) = import_items(store.as_ref(), &args).await?;
            println!("imported {items} items and {readers} readers");
        }
        DigestCommand::RunBatch(args) => {
            let report = run_batch(store, &config, args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        DigestCommand::Match(args) => {
            let matcher = RetrievalMatcher::new(
                store,
                config.matcher_config(args.limits.num_candidates, args.limits.limit)?,
            );
            let ids = matcher.match_embedding(&args.embedding).await?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
        }
        DigestCommand::MatchReader(args) => {
            let ids = match_reader(store, &config, &args).await?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
        }
    }
    Ok(())
}

pub async fn import_items(
    store: &dyn DigestStore,
    args: &ImportItemsArgs,
) -> Result<(usize, usize)> {
    let items = read_records::<Item>(&args.items)?;
    let item_count = items.len();
    for item in items {
        let item_id = item.id.clone();
        store
            .insert_item(item)
            .await
            .with_context(|| format!("failed to import item '{item_id}'"))?;
    }

    let mut reader_count = 0;
    if let Some(path) = &args.readers {
        for reader in read_records::<Reader>(path)? {
            let reader_id = reader.id.clone();
            store
                .upsert_reader(reader)
                .await
                .with_context(|| format!("failed to import reader '{reader_id}'"))?;
            reader_count += 1;
        }
    }
    tracing::info!(items = item_count, readers = reader_count, "import complete");
    Ok((item_count, reader_count))
}

/// Reads a JSON array, or one JSON object per line.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse JSON array in {}", path.display()));
    }

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("failed to parse line {} of {}", index + 1, path.display())
            })
        })
        .collect()
}

async fn run_batch(
    store: Arc<SqliteDigestStore>,
    config: &DigestFileConfig,
    args: RunBatchArgs,
) -> Result<BatchReport> {
    let provider = args.provider;
    let Some(api_key) = provider.api_key.filter(|key| !key.trim().is_empty()) else {
        bail!("missing API key: pass --api-key or set DIGEST_OPENAI_API_KEY");
    };
    let client = Arc::new(OpenAiClient::new(OpenAiConfig {
        request_timeout_ms: provider.request_timeout_ms,
        retry: RetryPolicy {
            max_retries: provider.max_retries,
            ..RetryPolicy::default()
        },
        ..OpenAiConfig::new(provider.api_base, api_key)
    })?);

    let templates = match config.templates_dir(args.templates_dir) {
        Some(dir) => PromptTemplates::from_dir(&dir)
            .with_context(|| format!("failed to load templates from {}", dir.display()))?,
        None => PromptTemplates::default(),
    };
    let generator = LlmDigestGenerator::new(
        client.clone(),
        config.generator_config(provider.chat_model),
    )
    .with_templates(templates.clone());
    let embedder =
        ProviderTextEmbedder::new(client, config.embedding_model(provider.embedding_model));
    let orchestrator = GenerationOrchestrator::new(Arc::new(generator), Arc::new(embedder))
        .with_templates(templates);

    let coordinator = BatchDigestCoordinator::new(
        store,
        orchestrator,
        config.coordinator_config(args.window_hours)?,
    );
    let report = coordinator.run_batch().await.context("batch run failed")?;
    Ok(report)
}

async fn match_reader(
    store: Arc<SqliteDigestStore>,
    config: &DigestFileConfig,
    args: &MatchReaderArgs,
) -> Result<Vec<String>> {
    let matcher = RetrievalMatcher::new(
        store,
        config.matcher_config(args.limits.num_candidates, args.limits.limit)?,
    );
    match matcher.match_reader(&args.reader_id).await {
        Ok(ids) => Ok(ids),
        Err(MatchError::ReaderNotFound(reader_id)) => {
            bail!("reader '{reader_id}' not found; import it with `import-items --readers`")
        }
        Err(error) => Err(error).context("reader match failed"),
    }
}
