//! Shared models used across the indexing and search crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Valid range for a field weight.
pub const WEIGHT_MIN: f64 = 0.1;
pub const WEIGHT_MAX: f64 = 10.0;

/// Valid range for a per-field similarity threshold.
pub const THRESHOLD_MIN: f64 = 0.0;
pub const THRESHOLD_MAX: f64 = 1.0;

/// One retrievable unit of a field: a slice of text plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorChunk {
    /// Tenant/isolation key grouping chunks and configs.
    pub namespace: String,
    /// Free-form entity type string (e.g., "post").
    pub entity_type: String,
    /// Opaque identifier of the owning record, assigned by the caller.
    pub record_key: String,
    /// Field of the record this chunk was cut from.
    pub field_name: String,
    /// Dense 0-based position within (namespace, entity_type, record_key, field_name).
    pub chunk_index: u32,
    /// Text content of the chunk.
    pub text: String,
    /// Embedding vector; length is fixed per deployment.
    pub embedding: Vec<f32>,
    /// Char offset of the chunk start in the original field text.
    pub start_position: usize,
    /// Char offset one past the chunk end in the original field text.
    pub end_position: usize,
    /// Opaque key-value metadata carried with the chunk.
    pub metadata: BTreeMap<String, String>,
    /// RFC 3339; preserved across upserts of the same identity.
    pub created_at: String,
    /// RFC 3339; refreshed on every upsert.
    pub updated_at: String,
}

/// Weighting/filtering policy for one field of one entity type.
///
/// Unique per (namespace, entity_type, field_name); those three are fixed at
/// creation, only weight/threshold/enabled may change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Storage-assigned id.
    pub id: i64,
    pub namespace: String,
    pub entity_type: String,
    pub field_name: String,
    /// Multiplier applied to the field's similarity before summing.
    pub weight: f64,
    /// Minimum similarity a field match must clear to count toward scoring.
    pub threshold: f64,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Resolved policy for one field. [`Default`] gives the values that apply
/// when no [`VectorConfig`] row exists; absence is never an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub weight: f64,
    pub threshold: f64,
    pub enabled: bool,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self { weight: 1.0, threshold: 0.0, enabled: true }
    }
}

impl From<&VectorConfig> for EffectiveConfig {
    fn from(config: &VectorConfig) -> Self {
        Self { weight: config.weight, threshold: config.threshold, enabled: config.enabled }
    }
}

/// Chunking bounds, all in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    /// Hard cap; a single sentence longer than this is force-split.
    pub max_tokens_per_chunk: usize,
    /// Close the current chunk before a sentence would push it past this.
    pub target_tokens_per_chunk: usize,
    /// Trailing-sentence overlap carried into the next chunk.
    pub overlap_tokens: usize,
    /// At or below this total, the whole text becomes a single chunk.
    pub min_tokens: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: 512,
            target_tokens_per_chunk: 256,
            overlap_tokens: 32,
            min_tokens: 64,
        }
    }
}

/// One ranked record returned by weighted search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub record_key: String,
    /// Weighted sum over the fields that cleared their thresholds.
    pub total_score: f64,
    /// Raw best similarity per field, reported even for fields the
    /// threshold excluded from total_score.
    pub per_field_score: BTreeMap<String, f64>,
}

/// Checks a weight against [`WEIGHT_MIN`]..[`WEIGHT_MAX`].
pub fn validate_weight(weight: f64) -> Result<(), String> {
    if !weight.is_finite() || weight < WEIGHT_MIN || weight > WEIGHT_MAX {
        return Err(format!(
            "weight {weight} outside valid range {WEIGHT_MIN}..{WEIGHT_MAX}"
        ));
    }
    Ok(())
}

/// Checks a threshold against [`THRESHOLD_MIN`]..[`THRESHOLD_MAX`].
pub fn validate_threshold(threshold: f64) -> Result<(), String> {
    if !threshold.is_finite() || threshold < THRESHOLD_MIN || threshold > THRESHOLD_MAX {
        return Err(format!(
            "threshold {threshold} outside valid range {THRESHOLD_MIN}..{THRESHOLD_MAX}"
        ));
    }
    Ok(())
}
