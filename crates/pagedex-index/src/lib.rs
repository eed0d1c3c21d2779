//! Incremental semantic search and backlink indexing for pages.
//!
//! This crate provides:
//! - Parsing of editor document trees into a typed node model
//! - Extraction of text units and fingerprint-based change detection
//! - A durable SQLite job queue drained by a bounded worker pool
//! - Embedding generation over HTTP with backoff and jitter
//! - Vector storage in Qdrant or in memory, with similarity search
//! - A backlink graph kept in sync on every save
//! - Background watching of a pages directory

pub mod backlinks;
pub mod db;
pub mod delta;
pub mod directory;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod indexer;
pub mod jobs;
pub mod retry;
pub mod search;
pub mod service;
pub mod store;
pub mod units;
pub mod watcher;

// Re-exports
pub use backlinks::{LinkEdge, LinkExtractor, LinkStore};
pub use db::Database;
pub use delta::{compute_delta, compute_set_delta, Delta};
pub use directory::{FsPageDirectory, PageDirectory};
pub use document::{Document, DocumentError, Node};
pub use embeddings::{EmbedMode, EmbeddingError, EmbeddingProvider, HttpEmbeddings};
pub use error::{FailureKind, IndexError, StoreError};
pub use extractor::{ExtractedUnit, ExtractorConfig, TreeExtractor};
pub use fingerprint::fingerprint;
pub use indexer::{IndexStats, Indexer};
pub use jobs::{Job, JobHandler, JobQueue, JobRunner, JobSummary, QueueConfig, QueueError};
pub use retry::RetryPolicy;
pub use search::{SearchOptions, SearchResult, SemanticSearcher};
pub use service::{IndexOverview, PageIndex, PageIndexConfig};
pub use store::{MemoryVectorStore, QdrantConfig, QdrantStore, VectorHit, VectorStore};
pub use units::{IndexedUnit, UnitStore};
pub use watcher::{PageEvent, PageWatcher, WatcherConfig, WatcherError};

/// Default Qdrant collection name
pub const DEFAULT_COLLECTION: &str = "pagedex-units";

/// Default embedding dimensions
pub const DEFAULT_DIMENSIONS: usize = 768;
