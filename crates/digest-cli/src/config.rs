//! Optional TOML configuration layered under command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use digest_cluster::ClusteringConfig;
use digest_pipeline::{CoordinatorConfig, GeneratorConfig, MatcherConfig};
use serde::Deserialize;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_WINDOW_HOURS: u64 = 24;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DigestFileConfig {
    /// Passed through to `ClusteringConfig::from_json`.
    pub clustering: Option<toml::Table>,
    pub generation: GenerationFileConfig,
    pub batch: BatchFileConfig,
    pub matcher: MatcherFileConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationFileConfig {
    pub chat_model: Option<String>,
    pub embedding_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub templates_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchFileConfig {
    pub window_hours: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherFileConfig {
    pub num_candidates: Option<usize>,
    pub limit: Option<usize>,
}

pub fn load_config(path: Option<&Path>) -> Result<DigestFileConfig> {
    let Some(path) = path else {
        return Ok(DigestFileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<DigestFileConfig> {
    toml::from_str(raw).context("failed to parse TOML")
}

impl DigestFileConfig {
    pub fn clustering_config(&self) -> Result<ClusteringConfig> {
        let Some(table) = &self.clustering else {
            return Ok(ClusteringConfig::default());
        };
        let value = serde_json::to_value(table).context("failed to convert [clustering] table")?;
        ClusteringConfig::from_json(&value).context("invalid [clustering] section")
    }

    /// Coordinator settings; `window_hours` from the command line wins over the file.
    pub fn coordinator_config(&self, window_hours: Option<u64>) -> Result<CoordinatorConfig> {
        let hours = window_hours
            .or(self.batch.window_hours)
            .unwrap_or(DEFAULT_WINDOW_HOURS);
        if hours == 0 {
            anyhow::bail!("batch window_hours must be greater than 0");
        }
        let hours = i64::try_from(hours).context("batch window_hours is too large")?;
        let window = Duration::try_hours(hours).context("batch window_hours is too large")?;
        Ok(CoordinatorConfig {
            window,
            clustering: self.clustering_config()?,
        })
    }

    pub fn generator_config(&self, chat_model: Option<String>) -> GeneratorConfig {
        let defaults = GeneratorConfig::default();
        GeneratorConfig {
            model: chat_model
                .or_else(|| self.generation.chat_model.clone())
                .unwrap_or(defaults.model),
            temperature: self.generation.temperature.or(defaults.temperature),
            max_tokens: self.generation.max_tokens.or(defaults.max_tokens),
        }
    }

    pub fn embedding_model(&self, embedding_model: Option<String>) -> String {
        embedding_model
            .or_else(|| self.generation.embedding_model.clone())
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string())
    }

    pub fn templates_dir(&self, templates_dir: Option<PathBuf>) -> Option<PathBuf> {
        templates_dir.or_else(|| self.generation.templates_dir.clone())
    }

    pub fn matcher_config(
        &self,
        num_candidates: Option<usize>,
        limit: Option<usize>,
    ) -> Result<MatcherConfig> {
        let defaults = MatcherConfig::default();
        let config = MatcherConfig {
            num_candidates: num_candidates
                .or(self.matcher.num_candidates)
                .unwrap_or(defaults.num_candidates),
            limit: limit.or(self.matcher.limit).unwrap_or(defaults.limit),
        };
        if config.num_candidates == 0 || config.limit == 0 {
            anyhow::bail!("matcher num_candidates and limit must be greater than 0");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{load_config, parse_config, DEFAULT_EMBEDDING_MODEL};
    use chrono::Duration;
    use std::path::PathBuf;

    #[test]
    fn functional_full_config_maps_onto_pipeline_settings() {
        let config = parse_config(
            r#"
            [clustering]
            min_group_size = 3
            reduce_dimensions = false

            [clustering.reduction]
            n_neighbors = 10

            [generation]
            chat_model = "file-chat"
            temperature = 0.0
            templates_dir = "prompts"

            [batch]
            window_hours = 12

            [matcher]
            limit = 20
            "#,
        )
        .expect("parse config");

        let clustering = config.clustering_config().expect("clustering");
        assert_eq!(clustering.min_group_size, 3);
        assert!(!clustering.reduce_dimensions);
        assert_eq!(clustering.reduction.n_neighbors, 10);

        let coordinator = config.coordinator_config(None).expect("coordinator");
        assert_eq!(coordinator.window, Duration::hours(12));
        assert_eq!(
            config.coordinator_config(Some(2)).expect("override").window,
            Duration::hours(2)
        );

        let generator = config.generator_config(None);
        assert_eq!(generator.model, "file-chat");
        assert_eq!(generator.temperature, Some(0.0));
        assert_eq!(config.generator_config(Some("flag-chat".to_string())).model, "flag-chat");
        assert_eq!(config.embedding_model(None), DEFAULT_EMBEDDING_MODEL);
        assert_eq!(config.templates_dir(None), Some(PathBuf::from("prompts")));

        let matcher = config.matcher_config(None, None).expect("matcher");
        assert_eq!(matcher.limit, 20);
        assert_eq!(matcher.num_candidates, 400);
    }

    #[test]
    fn unit_missing_config_uses_defaults() {
        let config = load_config(None).expect("defaults");
        let coordinator = config.coordinator_config(None).expect("coordinator");
        assert_eq!(coordinator.window, Duration::hours(24));
        assert_eq!(coordinator.clustering.min_group_size, 2);
        assert!(coordinator.clustering.reduce_dimensions);
    }

    #[test]
    fn regression_unknown_keys_and_invalid_clustering_are_rejected() {
        let error = parse_config("[batch]\nwindow = 3\n").expect_err("unknown key");
        assert!(format!("{error:#}").contains("unknown field"));

        let config = parse_config("[clustering]\nmin_group_size = 1\n").expect("parse");
        let error = config.clustering_config().expect_err("invalid clustering");
        assert!(format!("{error:#}").contains("min_cluster_size"));
    }

    #[test]
    fn regression_unreadable_config_path_reports_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.toml");
        let error = load_config(Some(&path)).expect_err("missing file");
        assert!(error.to_string().contains("missing.toml"));
    }
}
