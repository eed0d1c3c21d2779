//! Semantic search over indexed units.
//!
//! The query is embedded in query mode, the nearest unit vectors are fetched
//! and anything below the score cutoff is dropped before results are joined
//! with the stored unit text.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::directory::PageDirectory;
use crate::embeddings::{EmbedMode, EmbeddingProvider};
use crate::error::IndexError;
use crate::extractor::truncate_chars;
use crate::store::VectorStore;
use crate::units::UnitStore;

/// Default maximum number of results.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Default similarity cutoff.
pub const DEFAULT_MIN_SCORE: f32 = 0.6;

/// Longest text preview returned with a result.
pub const PREVIEW_MAX_CHARS: usize = 200;

/// A search hit joined with its unit text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Page containing the unit
    pub page_id: String,
    /// Matching unit
    pub unit_id: String,
    /// Similarity score (higher is better)
    pub score: f32,
    /// Start of the unit text
    pub text_preview: String,
    /// Page title, when a directory is attached
    pub title: Option<String>,
}

/// Options for one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Maximum number of results to return
    pub limit: usize,
    /// Results scoring below this are dropped
    pub min_score: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

/// Runs semantic queries against the vector store.
#[derive(Clone)]
pub struct SemanticSearcher {
    embeddings: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    units: UnitStore,
    directory: Option<Arc<dyn PageDirectory>>,
}

impl SemanticSearcher {
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        units: UnitStore,
    ) -> Self {
        Self {
            embeddings,
            vectors,
            units,
            directory: None,
        }
    }

    /// Decorate results with page titles and drop pages that are gone.
    pub fn with_directory(mut self, directory: Arc<dyn PageDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Search for units similar to `query`.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if query.trim().is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embeddings.embed(query, EmbedMode::Query).await?;
        let hits = self.vectors.nearest(&vector, options.limit).await?;
        let candidates = hits.len();

        let mut results = Vec::new();
        for hit in hits.into_iter().filter(|h| h.score >= options.min_score) {
            // Vector and unit row can briefly disagree while a job runs
            let Some(unit) = self.units.get(&hit.page_id, &hit.unit_id)? else {
                continue;
            };

            let title = match self.directory {
                Some(ref directory) => {
                    if !directory.page_exists(&hit.page_id).await {
                        continue;
                    }
                    directory.title(&hit.page_id).await
                }
                None => None,
            };

            results.push(SearchResult {
                page_id: hit.page_id,
                unit_id: hit.unit_id,
                score: hit.score,
                text_preview: truncate_chars(&unit.text, PREVIEW_MAX_CHARS),
                title,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.page_id.cmp(&b.page_id))
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });

        debug!(
            "Search returned {} of {} candidates (min score {})",
            results.len(),
            candidates,
            options.min_score
        );
        Ok(results)
    }
}
