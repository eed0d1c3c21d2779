//! Semantic index store: one vector per indexed unit.
//!
//! Records are keyed by `(page_id, unit_id)`. Every store has a fixed
//! dimensionality chosen at creation; a vector of any other length is
//! rejected with [`StoreError::DimensionMismatch`] rather than truncated.

pub mod memory;
pub mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::{QdrantConfig, QdrantStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    /// Page the unit belongs to
    pub page_id: String,
    /// Unit id within the page
    pub unit_id: String,
    /// Similarity score (higher is better)
    pub score: f32,
}

/// Storage and similarity search over unit embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the underlying collection if needed.
    async fn ensure(&self) -> Result<(), StoreError>;

    /// Insert or replace the vector of a unit.
    async fn upsert(&self, page_id: &str, unit_id: &str, vector: Vec<f32>)
        -> Result<(), StoreError>;

    /// Delete the vector of a unit. Deleting a missing record is not an error.
    async fn delete(&self, page_id: &str, unit_id: &str) -> Result<(), StoreError>;

    /// Delete every vector of a page.
    async fn delete_page(&self, page_id: &str) -> Result<(), StoreError>;

    /// Top `k` records by similarity to `query`, best first.
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, StoreError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Fixed dimensionality of the store.
    fn dimensions(&self) -> usize;
}

/// Reject vectors whose length differs from the store's dimensionality.
pub fn check_dimensions(expected: usize, vector: &[f32]) -> Result<(), StoreError> {
    if vector.len() != expected {
        return Err(StoreError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
