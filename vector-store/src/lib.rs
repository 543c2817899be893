//! Persistence for vector chunks and per-field search configs.
//!
//! [`SqliteVectorStore`] keeps both tables in one SQLite database: chunk
//! rows with their embeddings as f32 blobs, and config rows carrying
//! weight/threshold/enabled per (namespace, entity_type, field_name).
//! Similarity queries evaluate cosine in the store and aggregate the best
//! chunk per group. [`TtlCache`] is the read cache services put in front of
//! config lookups.

pub mod sqlite_store;
pub mod ttl_cache;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite_store::SqliteVectorStore;
pub use ttl_cache::TtlCache;

use vector_model::{VectorChunk, VectorConfig};

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("vector config {0} does not exist")]
    ConfigNotFound(i64),
    #[error("vector config already exists for ({namespace}, {entity_type}, {field_name})")]
    ConfigExists {
        namespace: String,
        entity_type: String,
        field_name: String,
    },
    #[error("invalid vector: {0}")]
    InvalidVector(String),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

/// Best similarity of one (record, field) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSimilarity {
    pub record_key: String,
    pub field_name: String,
    pub similarity: f64,
}

/// Best similarity of one record, collapsed across its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSimilarity {
    pub record_key: String,
    pub similarity: f64,
}

/// Payload for creating a config row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVectorConfig {
    pub namespace: String,
    pub entity_type: String,
    pub field_name: String,
    pub weight: f64,
    pub threshold: f64,
    pub enabled: bool,
}

/// Partial config update. The key triple is immutable; absent members keep
/// their stored value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub weight: Option<f64>,
    pub threshold: Option<f64>,
    pub enabled: Option<bool>,
}

/// Optional conjunctive filters for config listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFilter {
    pub entity_type: Option<String>,
    pub field_name: Option<String>,
    pub enabled: Option<bool>,
}

/// Bulk chunk persistence plus the similarity primitives search runs on.
pub trait ChunkStore {
    /// Writes all chunks in one transaction, replacing rows that share an
    /// identity. Returns the number of rows written.
    fn batch_upsert(&mut self, chunks: &[VectorChunk]) -> Result<usize, StoreError>;

    /// Deletes a record's rows; `field_name` of `None` means all fields.
    /// Returns the deleted row count.
    fn delete_by_filters(
        &mut self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        field_name: Option<&str>,
    ) -> Result<usize, StoreError>;

    /// Replaces a record's full chunk set inside one transaction. Returns
    /// (deleted, inserted) row counts.
    fn replace_record_chunks(
        &mut self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        chunks: &[VectorChunk],
    ) -> Result<(usize, usize), StoreError>;

    /// Best cosine similarity per (record, field) group, descending; ties
    /// order by ascending record_key then field_name.
    fn best_similarity_per_field(
        &self,
        query: &[f32],
        namespace: &str,
        entity_type: &str,
        field_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FieldSimilarity>, StoreError>;

    /// Best cosine similarity per record across all fields.
    fn best_similarity_per_record(
        &self,
        query: &[f32],
        namespace: &str,
        entity_type: &str,
        limit: usize,
    ) -> Result<Vec<RecordSimilarity>, StoreError>;
}

/// CRUD over config rows, unique per (namespace, entity_type, field_name).
pub trait ConfigStore {
    /// Fails with [`StoreError::ConfigExists`] on a duplicate key.
    fn create_config(&mut self, new: &NewVectorConfig) -> Result<VectorConfig, StoreError>;

    /// Fails with [`StoreError::ConfigNotFound`] when `id` has no row.
    fn update_config(&mut self, id: i64, patch: &ConfigPatch) -> Result<VectorConfig, StoreError>;

    /// Returns the removed row so callers can invalidate caches by key.
    fn delete_config(&mut self, id: i64) -> Result<VectorConfig, StoreError>;

    fn find_config(&self, id: i64) -> Result<Option<VectorConfig>, StoreError>;

    fn find_config_by_key(
        &self,
        namespace: &str,
        entity_type: &str,
        field_name: &str,
    ) -> Result<Option<VectorConfig>, StoreError>;

    fn find_all_configs(&self) -> Result<Vec<VectorConfig>, StoreError>;

    fn find_configs_by_filters(&self, filter: &ConfigFilter)
        -> Result<Vec<VectorConfig>, StoreError>;

    /// Field names with an enabled config under (namespace, entity_type).
    fn list_enabled_fields(
        &self,
        namespace: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, StoreError>;
}
