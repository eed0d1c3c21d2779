//! Configuration for pagedex.
//!
//! Settings come from a TOML file (by default
//! `~/.config/pagedex/config.toml`) overlaid with `PAGEDEX__<SECTION>__<KEY>`
//! environment variables. Every field has a default, so a missing file or a
//! partial one is fine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PAGEDEX";

/// Separator between section and key in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Errors raised when a loaded configuration is unusable.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("embeddings.dimensions must be greater than zero")]
    ZeroDimensions,

    #[error("jobs.workers must be at least 1")]
    NoWorkers,

    #[error("jobs.max_attempts must be at least 1")]
    NoAttempts,

    #[error("search.min_score must be within [-1, 1], got {0}")]
    MinScoreOutOfRange(f32),

    #[error("vector_store.qdrant_url is required for the qdrant backend")]
    MissingQdrantUrl,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding units, links and jobs
    pub database_path: String,
    pub embeddings: EmbeddingsConfig,
    pub vector_store: VectorStoreConfig,
    pub extraction: ExtractionConfig,
    pub search: SearchConfig,
    pub jobs: JobsConfig,
    pub watcher: WatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        let database_path = dirs::data_dir()
            .map(|dir| dir.join("pagedex").join("index.db"))
            .unwrap_or_else(|| PathBuf::from("pagedex.db"));
        Self {
            database_path: database_path.to_string_lossy().into_owned(),
            embeddings: EmbeddingsConfig::default(),
            vector_store: VectorStoreConfig::default(),
            extraction: ExtractionConfig::default(),
            search: SearchConfig::default(),
            jobs: JobsConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Embedding service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    /// Literal key or `${VAR}` to read it from the environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub dimensions: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Stop retrying once this much time has passed
    pub retry_window_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/embed".to_string(),
            api_key: None,
            model: None,
            dimensions: 768,
            timeout_secs: 30,
            max_retries: 3,
            retry_base_ms: 200,
            retry_max_ms: 5_000,
            retry_window_secs: 30,
        }
    }
}

impl EmbeddingsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key with `${VAR}` references resolved. Unset variables and empty
    /// keys yield `None`.
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key_optional(&self.api_key)
    }
}

/// Where embedding vectors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Process-local store, lost on exit
    Memory,
    Qdrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub qdrant_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qdrant_api_key: Option<String>,
    pub collection_name: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Qdrant,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection_name: "pagedex-units".to_string(),
        }
    }
}

impl VectorStoreConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key_optional(&self.qdrant_api_key)
    }
}

/// Which nodes become units. Unset type lists keep the built-in ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexable_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_types: Option<Vec<String>>,
    pub min_text_len: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            indexable_types: None,
            skip_types: None,
            min_text_len: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub limit: usize,
    pub min_score: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.6,
        }
    }
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub workers: usize,
    /// Failures before a job is dead-lettered
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: f64,
    pub timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.2,
            timeout_secs: 300,
        }
    }
}

impl JobsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`, then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load`], reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };

        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(config::File::from(path.as_path()).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .source(env.map(|vars| vars.into_iter().collect())),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embeddings.dimensions == 0 {
            return Err(ConfigError::ZeroDimensions);
        }
        if self.jobs.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.jobs.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if !(-1.0..=1.0).contains(&self.search.min_score) {
            return Err(ConfigError::MinScoreOutOfRange(self.search.min_score));
        }
        if self.vector_store.backend == VectorBackend::Qdrant
            && self.vector_store.qdrant_url.trim().is_empty()
        {
            return Err(ConfigError::MissingQdrantUrl);
        }
        Ok(())
    }

    /// Database path with `~` and environment variables expanded.
    pub fn database_path(&self) -> Result<PathBuf> {
        expand_path(&self.database_path)
    }

    /// Write the default configuration to `path`, creating parent
    /// directories. An existing file is only replaced when `force` is set.
    pub fn write_default(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!("{} already exists", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents =
            toml::to_string_pretty(&Config::default()).context("Failed to serialize defaults")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// `~/.config/pagedex/config.toml` on Linux; the platform equivalent
/// elsewhere.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pagedex").join("config.toml"))
}

/// Expand `~` and `$VAR` / `${VAR}` in a path.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(path).with_context(|| format!("Failed to expand path {}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Resolve an API key that may be a `${VAR}` reference.
fn resolve_api_key_optional(api_key: &Option<String>) -> Option<String> {
    match api_key {
        Some(key) if key.starts_with("${") && key.ends_with('}') => {
            let var_name = &key[2..key.len() - 1];
            std::env::var(var_name).ok().filter(|v| !v.is_empty())
        }
        Some(key) if !key.is_empty() => Some(key.clone()),
        _ => None,
    }
}
