//! Error types shared across the indexing pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::document::DocumentError;
use crate::embeddings::EmbeddingError;
use crate::jobs::QueueError;

/// Errors raised by the persisted stores (SQLite tables and vector stores).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Vector has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Vector store backend error: {0}")]
    Backend(String),

    #[error("Database lock poisoned")]
    Poisoned,
}

/// How the job queue should treat a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The snapshot can never be processed; discard the job.
    Malformed,
    /// Worth retrying later; unlock the job.
    Transient,
    /// A configuration problem or a vanished page; never retry automatically.
    Fatal,
}

/// Errors from processing one index job.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Malformed document: {0}")]
    MalformedDocument(#[from] DocumentError),

    #[error("Embedding failed: {0}")]
    Embedding(EmbeddingError),

    #[error("Storage failed: {0}")]
    Storage(StoreError),

    #[error("Vector has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Page {0} no longer exists")]
    PageMissing(String),

    #[error("Job exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Job queue failed: {0}")]
    Queue(#[from] QueueError),
}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                IndexError::DimensionMismatch { expected, actual }
            }
            other => IndexError::Storage(other),
        }
    }
}

impl From<EmbeddingError> for IndexError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::DimensionMismatch { expected, actual } => {
                IndexError::DimensionMismatch { expected, actual }
            }
            other => IndexError::Embedding(other),
        }
    }
}

impl IndexError {
    /// Classify this error for the job queue's failure boundary.
    pub fn kind(&self) -> FailureKind {
        match self {
            IndexError::MalformedDocument(_) => FailureKind::Malformed,
            IndexError::Embedding(_)
            | IndexError::Storage(_)
            | IndexError::Timeout(_)
            | IndexError::Queue(_) => FailureKind::Transient,
            IndexError::DimensionMismatch { .. } | IndexError::PageMissing(_) => FailureKind::Fatal,
        }
    }
}
