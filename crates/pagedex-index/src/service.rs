//! The page index: one entry point over backlinks, the job queue and
//! semantic search.
//!
//! Saving a page does the cheap work inline (parse, backlink sync, enqueue)
//! and hands embedding to the background drain. Search and backlink queries
//! read the stores directly.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backlinks::{LinkEdge, LinkExtractor, LinkStore};
use crate::db::Database;
use crate::directory::PageDirectory;
use crate::document::Document;
use crate::embeddings::EmbeddingProvider;
use crate::error::IndexError;
use crate::extractor::{ExtractorConfig, TreeExtractor};
use crate::indexer::Indexer;
use crate::jobs::{JobQueue, JobRunner, JobSummary, QueueConfig, DEFAULT_JOB_TIMEOUT};
use crate::search::{SearchOptions, SearchResult, SemanticSearcher};
use crate::store::VectorStore;
use crate::units::UnitStore;

/// Configuration for a [`PageIndex`].
#[derive(Debug, Clone)]
pub struct PageIndexConfig {
    /// What counts as a unit
    pub extractor: ExtractorConfig,
    /// Retry and dead-letter settings
    pub queue: QueueConfig,
    /// Concurrent drain tasks
    pub workers: usize,
    /// Deadline for one job
    pub job_timeout: Duration,
}

impl Default for PageIndexConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            queue: QueueConfig::default(),
            workers: 1,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Counts across all stores.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOverview {
    pub pages: usize,
    pub units: usize,
    pub vectors: usize,
    pub links: usize,
    pub pending_jobs: usize,
    pub dead_jobs: usize,
}

/// Incremental semantic and backlink index over pages.
pub struct PageIndex {
    units: UnitStore,
    links: LinkStore,
    link_extractor: LinkExtractor,
    vectors: Arc<dyn VectorStore>,
    indexer: Indexer,
    searcher: SemanticSearcher,
    runner: JobRunner,
}

impl PageIndex {
    /// Open the index on `db`, recovering any interrupted jobs.
    ///
    /// Nothing is drained until the first save or an explicit
    /// [`PageIndex::kick`].
    pub async fn open(
        db: Database,
        vectors: Arc<dyn VectorStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        config: PageIndexConfig,
        directory: Option<Arc<dyn PageDirectory>>,
    ) -> Result<Self, IndexError> {
        vectors.ensure().await?;
        if embeddings.dimensions() != vectors.dimensions() {
            warn!(
                "Embedding model {} produces {} dimensions but the vector store expects {}",
                embeddings.model_name(),
                embeddings.dimensions(),
                vectors.dimensions()
            );
        }

        let extractor = TreeExtractor::new(config.extractor);
        let units = UnitStore::new(db.clone());
        let links = LinkStore::new(db.clone());
        let queue = JobQueue::open(db, config.queue)?;

        let mut indexer = Indexer::new(
            extractor.clone(),
            units.clone(),
            Arc::clone(&vectors),
            Arc::clone(&embeddings),
        );
        let mut searcher = SemanticSearcher::new(embeddings, Arc::clone(&vectors), units.clone());
        if let Some(directory) = directory {
            indexer = indexer.with_directory(Arc::clone(&directory));
            searcher = searcher.with_directory(directory);
        }

        let runner = JobRunner::new(
            queue,
            Arc::new(indexer.clone()),
            config.workers,
            config.job_timeout,
        );

        Ok(Self {
            units,
            links,
            link_extractor: LinkExtractor::new(extractor),
            vectors,
            indexer,
            searcher,
            runner,
        })
    }

    /// Record a new snapshot of a page.
    ///
    /// Backlinks are updated before this returns; embedding is queued. A
    /// malformed snapshot is rejected without touching either index.
    /// Returns the job sequence number.
    pub async fn save_page(&self, page_id: &str, snapshot: &str) -> Result<i64, IndexError> {
        self.submit(page_id, snapshot, false).await
    }

    /// Re-embed every unit of a page from `snapshot`, changed or not.
    ///
    /// The request is recorded on the queued job, so a job for the page
    /// that is already running finishes first and nothing is purged under it.
    pub async fn reindex(&self, page_id: &str, snapshot: &str) -> Result<i64, IndexError> {
        self.submit(page_id, snapshot, true).await
    }

    async fn submit(&self, page_id: &str, snapshot: &str, reindex: bool) -> Result<i64, IndexError> {
        let doc = match Document::parse(snapshot) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Rejected malformed snapshot of page {}: {}", page_id, e);
                return Err(e.into());
            }
        };

        let edges = self.link_extractor.extract(page_id, &doc);
        self.links.sync_page(page_id, &edges)?;

        let queue = self.runner.queue();
        let seq = if reindex {
            queue.enqueue_reindex(page_id, snapshot)?
        } else {
            queue.enqueue(page_id, snapshot)?
        };
        self.runner.kick();
        Ok(seq)
    }

    /// Forget a page: queued jobs, units, vectors and its outgoing links.
    ///
    /// Links from other pages into this one stay until those pages change.
    pub async fn remove_page(&self, page_id: &str) -> Result<(), IndexError> {
        let jobs = self.runner.queue().remove_page(page_id)?;
        let links = self.links.remove_source(page_id)?;
        let units = self.indexer.purge_page(page_id).await?;
        info!(
            "Removed page {} ({} jobs, {} units, {} links)",
            page_id, jobs, units, links
        );
        Ok(())
    }

    /// Semantic search over all indexed units.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.searcher.search(query, options).await
    }

    /// Pages referencing `page_id`.
    pub fn backlinks(&self, page_id: &str) -> Result<Vec<LinkEdge>, IndexError> {
        Ok(self.links.backlinks(page_id)?)
    }

    /// References made by `page_id`.
    pub fn outgoing(&self, page_id: &str) -> Result<Vec<LinkEdge>, IndexError> {
        Ok(self.links.outgoing(page_id)?)
    }

    /// Start draining queued jobs in the background.
    pub fn kick(&self) {
        self.runner.kick();
    }

    /// Process every claimable job and wait for the drain to go idle.
    pub async fn drain_until_idle(&self) -> Result<(), IndexError> {
        Ok(self.runner.drain_until_idle().await?)
    }

    /// All queued jobs.
    pub fn jobs(&self) -> Result<Vec<JobSummary>, IndexError> {
        Ok(self.runner.queue().list()?)
    }

    /// Dead-lettered jobs.
    pub fn dead_letters(&self) -> Result<Vec<JobSummary>, IndexError> {
        Ok(self.runner.queue().dead_letters()?)
    }

    /// Revive dead-lettered jobs and start draining them.
    pub fn retry_dead(&self) -> Result<usize, IndexError> {
        let revived = self.runner.queue().retry_dead()?;
        if revived > 0 {
            self.runner.kick();
        }
        Ok(revived)
    }

    /// Counts across all stores.
    pub async fn stats(&self) -> Result<IndexOverview, IndexError> {
        let queue = self.runner.queue();
        Ok(IndexOverview {
            pages: self.units.page_count()?,
            units: self.units.count()?,
            vectors: self.vectors.count().await?,
            links: self.links.count()?,
            pending_jobs: queue.pending_count()?,
            dead_jobs: queue.dead_letters()?.len(),
        })
    }
}
