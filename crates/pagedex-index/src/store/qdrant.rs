//! Qdrant-backed vector store.
//!
//! Each unit becomes one point. The point id is a UUIDv5 derived from
//! `(page_id, unit_id)` so re-indexing a unit overwrites its point in place;
//! the ids themselves travel in the payload for the way back.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, vectors_config, CollectionInfo, Condition, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, PointId, PointStruct, PointsIdsList,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{check_dimensions, VectorHit, VectorStore};
use crate::error::StoreError;

const PAGE_ID_KEY: &str = "page_id";
const UNIT_ID_KEY: &str = "unit_id";

/// Configuration for connecting to Qdrant.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    /// Qdrant server URL
    pub url: String,

    /// API key (optional)
    pub api_key: Option<String>,

    /// Collection name
    pub collection_name: String,

    /// Vector dimensions
    pub dimensions: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_name: crate::DEFAULT_COLLECTION.to_string(),
            dimensions: crate::DEFAULT_DIMENSIONS,
        }
    }
}

/// Vector store on a Qdrant collection.
pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
    dimensions: usize,
}

impl QdrantStore {
    /// Create a store from configuration. Does not touch the server yet.
    pub fn from_config(config: &QdrantConfig) -> Result<Self, StoreError> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder.build().map_err(backend)?;
        info!("Connected to Qdrant at {}", config.url);

        Ok(Self {
            client,
            collection_name: config.collection_name.clone(),
            dimensions: config.dimensions,
        })
    }

    /// Get collection name.
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure(&self) -> Result<(), StoreError> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(backend)?;

        if exists {
            let info = self
                .client
                .collection_info(&self.collection_name)
                .await
                .map_err(backend)?;
            let size = info.result.as_ref().and_then(collection_vector_size);
            if size.is_none() {
                warn!(
                    "Collection {} has no single unnamed vector config",
                    self.collection_name
                );
            }
            if let Err(e) = check_collection_size(self.dimensions, size) {
                error!("Collection {}: {}", self.collection_name, e);
                return Err(e);
            }
            debug!("Collection {} already exists", self.collection_name);
            return Ok(());
        }

        info!(
            "Creating collection: {} with {} dimensions",
            self.collection_name, self.dimensions
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                    VectorParamsBuilder::new(self.dimensions as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn upsert(
        &self,
        page_id: &str,
        unit_id: &str,
        vector: Vec<f32>,
    ) -> Result<(), StoreError> {
        check_dimensions(self.dimensions, &vector)?;

        let point = PointStruct::new(point_id(page_id, unit_id), vector, payload(page_id, unit_id));
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, vec![point]).wait(true))
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn delete(&self, page_id: &str, unit_id: &str) -> Result<(), StoreError> {
        let ids = vec![PointId::from(point_id(page_id, unit_id))];
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn delete_page(&self, page_id: &str) -> Result<(), StoreError> {
        debug!("Deleting all points of page {}", page_id);
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(Filter::must([Condition::matches(
                        PAGE_ID_KEY,
                        page_id.to_string(),
                    )]))
                    .wait(true),
            )
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, StoreError> {
        check_dimensions(self.dimensions, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, query.to_vec(), k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(backend)?;

        let hits: Vec<VectorHit> = results
            .result
            .into_iter()
            .filter_map(|p| {
                let page_id = extract_string(p.payload.get(PAGE_ID_KEY))?;
                let unit_id = extract_string(p.payload.get(UNIT_ID_KEY))?;
                Some(VectorHit {
                    page_id,
                    unit_id,
                    score: p.score,
                })
            })
            .collect();

        debug!("Found {} nearest neighbors", hits.len());
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .map_err(backend)?;

        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Vector size of a collection with a single unnamed vector.
fn collection_vector_size(info: &CollectionInfo) -> Option<u64> {
    let config = info
        .config
        .as_ref()?
        .params
        .as_ref()?
        .vectors_config
        .as_ref()?
        .config
        .as_ref()?;
    match config {
        vectors_config::Config::Params(params) => Some(params.size),
        vectors_config::Config::ParamsMap(_) => None,
    }
}

/// An existing collection must hold vectors of the configured size.
fn check_collection_size(expected: usize, actual: Option<u64>) -> Result<(), StoreError> {
    match actual {
        Some(size) if size as usize != expected => Err(StoreError::DimensionMismatch {
            expected,
            actual: size as usize,
        }),
        _ => Ok(()),
    }
}

/// Deterministic point id for a unit.
pub fn point_id(page_id: &str, unit_id: &str) -> String {
    let key = format!("{}\u{0}{}", page_id, unit_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn payload(page_id: &str, unit_id: &str) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert(PAGE_ID_KEY.to_string(), Value::from(page_id.to_string()));
    map.insert(UNIT_ID_KEY.to_string(), Value::from(unit_id.to_string()));
    map
}

fn extract_string(value: Option<&Value>) -> Option<String> {
    match value.and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

fn backend(err: qdrant_client::QdrantError) -> StoreError {
    StoreError::Backend(err.to_string())
}
