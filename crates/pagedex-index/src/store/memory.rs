//! In-process vector store with brute-force cosine similarity.
//!
//! Used for local runs without a Qdrant server and throughout the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_dimensions, VectorHit, VectorStore};
use crate::error::StoreError;

/// Vector store kept entirely in memory.
pub struct MemoryVectorStore {
    dimensions: usize,
    records: RwLock<HashMap<(String, String), Vec<f32>>>,
}

impl MemoryVectorStore {
    /// Create an empty store with the given dimensionality.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Get the stored vector of a unit.
    pub async fn get(&self, page_id: &str, unit_id: &str) -> Option<Vec<f32>> {
        self.records
            .read()
            .await
            .get(&(page_id.to_string(), unit_id.to_string()))
            .cloned()
    }

    /// All stored keys, sorted.
    pub async fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(
        &self,
        page_id: &str,
        unit_id: &str,
        vector: Vec<f32>,
    ) -> Result<(), StoreError> {
        check_dimensions(self.dimensions, &vector)?;
        self.records
            .write()
            .await
            .insert((page_id.to_string(), unit_id.to_string()), vector);
        Ok(())
    }

    async fn delete(&self, page_id: &str, unit_id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(&(page_id.to_string(), unit_id.to_string()));
        Ok(())
    }

    async fn delete_page(&self, page_id: &str) -> Result<(), StoreError> {
        self.records.write().await.retain(|(page, _), _| page != page_id);
        Ok(())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, StoreError> {
        check_dimensions(self.dimensions, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let records = self.records.read().await;
        let mut hits: Vec<VectorHit> = records
            .iter()
            .map(|((page_id, unit_id), vector)| VectorHit {
                page_id: page_id.clone(),
                unit_id: unit_id.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.page_id.cmp(&b.page_id))
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        hits.truncate(k);

        debug!("Found {} nearest neighbors", hits.len());
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Cosine similarity of two equal-length vectors; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
