//! Building a [`PageIndex`] from loaded configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use pagedex_config::{Config, VectorBackend};
use pagedex_index::{
    Database, EmbeddingProvider, ExtractorConfig, FsPageDirectory, HttpEmbeddings,
    MemoryVectorStore, PageDirectory, PageIndex, PageIndexConfig, QdrantConfig, QdrantStore,
    QueueConfig, RetryPolicy, SearchOptions, VectorStore, WatcherConfig,
};

pub fn extractor_config(config: &Config) -> ExtractorConfig {
    let mut extractor = ExtractorConfig {
        min_text_len: config.extraction.min_text_len,
        ..ExtractorConfig::default()
    };
    if let Some(types) = &config.extraction.indexable_types {
        extractor.indexable_types = types.iter().cloned().collect();
    }
    if let Some(types) = &config.extraction.skip_types {
        extractor.skip_types = types.iter().cloned().collect();
    }
    extractor
}

pub fn index_config(config: &Config) -> PageIndexConfig {
    let jobs = &config.jobs;
    PageIndexConfig {
        extractor: extractor_config(config),
        queue: QueueConfig {
            max_attempts: jobs.max_attempts,
            backoff: RetryPolicy {
                max_attempts: jobs.max_attempts,
                base_delay: Duration::from_millis(jobs.backoff_base_ms),
                max_delay: Duration::from_millis(jobs.backoff_max_ms),
                jitter: jobs.backoff_jitter,
                ..QueueConfig::default().backoff
            },
        },
        workers: jobs.workers,
        job_timeout: jobs.timeout(),
    }
}

pub fn search_options(
    config: &Config,
    limit: Option<usize>,
    min_score: Option<f32>,
) -> SearchOptions {
    SearchOptions {
        limit: limit.unwrap_or(config.search.limit),
        min_score: min_score.unwrap_or(config.search.min_score),
    }
}

pub fn watcher_config(config: &Config) -> WatcherConfig {
    WatcherConfig {
        debounce: config.watcher.debounce(),
    }
}

fn embeddings(config: &Config) -> HttpEmbeddings {
    let e = &config.embeddings;
    HttpEmbeddings::new(e.base_url.clone(), e.dimensions)
        .with_api_key(e.resolved_api_key())
        .with_model(e.model.clone())
        .with_timeout(e.timeout())
        .with_retry(RetryPolicy {
            max_attempts: e.max_retries.max(1),
            base_delay: Duration::from_millis(e.retry_base_ms),
            max_delay: Duration::from_millis(e.retry_max_ms),
            max_elapsed: Duration::from_secs(e.retry_window_secs),
            ..RetryPolicy::default()
        })
}

fn vector_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    let dimensions = config.embeddings.dimensions;
    match config.vector_store.backend {
        VectorBackend::Memory => Ok(Arc::new(MemoryVectorStore::new(dimensions))),
        VectorBackend::Qdrant => {
            let qdrant = QdrantConfig {
                url: config.vector_store.qdrant_url.clone(),
                api_key: config.vector_store.resolved_api_key(),
                collection_name: config.vector_store.collection_name.clone(),
                dimensions,
            };
            let store =
                QdrantStore::from_config(&qdrant).context("Failed to create Qdrant client")?;
            Ok(Arc::new(store))
        }
    }
}

/// Open the index described by `config`. `pages_dir`, when given, is used
/// to drop jobs for deleted pages and to title search results.
pub async fn open_index(config: &Config, pages_dir: Option<&Path>) -> Result<PageIndex> {
    let db_path = config.database_path()?;
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(embeddings(config));
    let directory = pages_dir.map(|dir| {
        debug!("Using pages directory {:?}", dir);
        Arc::new(FsPageDirectory::new(dir)) as Arc<dyn PageDirectory>
    });

    PageIndex::open(db, vector_store(config)?, embeddings, index_config(config), directory)
        .await
        .context("Failed to open page index")
}
