//! Per-page semantic indexing.
//!
//! The Indexer turns one page snapshot into embedding writes. It extracts the
//! current units, diffs their fingerprints against what was last indexed and
//! only embeds what was added or changed. Units that disappeared lose both
//! their vector and their unit row.
//!
//! Vectors are written before the unit row, so an interruption between the
//! two causes a re-embed on the next run rather than a unit without a vector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::delta::compute_delta;
use crate::directory::PageDirectory;
use crate::document::Document;
use crate::embeddings::{EmbedMode, EmbeddingProvider};
use crate::error::IndexError;
use crate::extractor::TreeExtractor;
use crate::fingerprint::fingerprint;
use crate::jobs::{Job, JobHandler};
use crate::store::VectorStore;
use crate::units::{IndexedUnit, UnitStore};

/// Statistics about one indexing pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Units seen for the first time
    pub units_added: usize,
    /// Units whose text changed
    pub units_updated: usize,
    /// Units that no longer exist
    pub units_removed: usize,
    /// Units left untouched
    pub units_unchanged: usize,
    /// Embedding requests made
    pub embedding_calls: usize,
    /// Total time in milliseconds
    pub duration_ms: u64,
}

/// Applies page snapshots to the unit and vector stores.
#[derive(Clone)]
pub struct Indexer {
    extractor: TreeExtractor,
    units: UnitStore,
    vectors: Arc<dyn VectorStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    directory: Option<Arc<dyn PageDirectory>>,
}

impl Indexer {
    /// Create a new indexer.
    pub fn new(
        extractor: TreeExtractor,
        units: UnitStore,
        vectors: Arc<dyn VectorStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            extractor,
            units,
            vectors,
            embeddings,
            directory: None,
        }
    }

    /// Consult `directory` before each job and drop jobs of deleted pages.
    pub fn with_directory(mut self, directory: Arc<dyn PageDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Bring the stored units of `page_id` in line with `doc`.
    pub async fn index_page(&self, page_id: &str, doc: &Document) -> Result<IndexStats, IndexError> {
        self.apply(page_id, doc, false).await
    }

    /// Like [`index_page`](Self::index_page), but units whose text is
    /// unchanged are re-embedded too.
    pub async fn reindex_page(
        &self,
        page_id: &str,
        doc: &Document,
    ) -> Result<IndexStats, IndexError> {
        self.apply(page_id, doc, true).await
    }

    async fn apply(
        &self,
        page_id: &str,
        doc: &Document,
        reindex: bool,
    ) -> Result<IndexStats, IndexError> {
        let start = Instant::now();
        let mut stats = IndexStats::default();

        let current: HashMap<String, String> = self
            .extractor
            .extract(doc)
            .into_iter()
            .map(|u| (u.unit_id, u.text))
            .collect();
        let current_fingerprints: HashMap<String, String> = current
            .iter()
            .map(|(id, text)| (id.clone(), fingerprint(text)))
            .collect();

        let previous_fingerprints: HashMap<String, String> = self
            .units
            .load_page(page_id)?
            .into_iter()
            .map(|(id, unit)| (id, unit.fingerprint))
            .collect();

        let mut delta = compute_delta(&previous_fingerprints, &current_fingerprints);
        if reindex {
            delta.to_update = current
                .keys()
                .filter(|id| previous_fingerprints.contains_key(*id))
                .cloned()
                .collect();
            delta.to_update.sort();
        }
        stats.units_added = delta.to_add.len();
        stats.units_updated = delta.to_update.len();
        stats.units_removed = delta.to_remove.len();
        stats.units_unchanged = current.len() - delta.to_add.len() - delta.to_update.len();

        if delta.is_empty() {
            debug!("Page {} unchanged, nothing to embed", page_id);
            stats.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(stats);
        }

        for unit_id in delta.to_add.iter().chain(delta.to_update.iter()) {
            let text = &current[unit_id];
            let vector = self.embeddings.embed(text, EmbedMode::Document).await?;
            stats.embedding_calls += 1;

            if vector.len() != self.vectors.dimensions() {
                return Err(IndexError::DimensionMismatch {
                    expected: self.vectors.dimensions(),
                    actual: vector.len(),
                });
            }

            self.vectors.upsert(page_id, unit_id, vector).await?;
            self.units.upsert(&IndexedUnit {
                page_id: page_id.to_string(),
                unit_id: unit_id.clone(),
                text: text.clone(),
                fingerprint: current_fingerprints[unit_id].clone(),
            })?;
        }

        for unit_id in &delta.to_remove {
            self.vectors.delete(page_id, unit_id).await?;
            self.units.remove(page_id, unit_id)?;
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Indexed page {}: +{} ~{} -{} ({} embedding calls, {}ms)",
            page_id,
            stats.units_added,
            stats.units_updated,
            stats.units_removed,
            stats.embedding_calls,
            stats.duration_ms
        );
        Ok(stats)
    }

    /// Drop every unit and vector of a page.
    pub async fn purge_page(&self, page_id: &str) -> Result<usize, IndexError> {
        self.vectors.delete_page(page_id).await?;
        let removed = self.units.remove_page(page_id)?;
        debug!("Purged {} units of page {}", removed, page_id);
        Ok(removed)
    }
}

#[async_trait]
impl JobHandler for Indexer {
    async fn handle(&self, job: &Job) -> Result<(), IndexError> {
        if let Some(ref directory) = self.directory {
            if !directory.page_exists(&job.page_id).await {
                self.purge_page(&job.page_id).await?;
                return Err(IndexError::PageMissing(job.page_id.clone()));
            }
        }

        let doc = Document::parse(&job.snapshot)?;
        if job.reindex {
            self.reindex_page(&job.page_id, &doc).await?;
        } else {
            self.index_page(&job.page_id, &doc).await?;
        }
        Ok(())
    }
}
