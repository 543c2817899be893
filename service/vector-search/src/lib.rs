use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use embedding_gateway::config::GATEWAY_DEFAULTS;
use embedding_gateway::embedder::{Embedder, EmbedderError, EmbedderInfo};
use embedding_gateway::gateway::EmbeddingGateway;
use serde::{Deserialize, Serialize};
use text_chunker::{chunk_text, Chunk};
use vector_model::{
    validate_threshold, validate_weight, ChunkingParams, EffectiveConfig, SearchResult,
    VectorChunk, VectorConfig,
};
use vector_store::{
    ChunkStore, ConfigFilter, ConfigPatch, ConfigStore, NewVectorConfig, SqliteVectorStore,
    StoreError, TtlCache,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConfigExists {
                namespace,
                entity_type,
                field_name,
            } => ServiceError::Conflict(format!(
                "config for {namespace}/{entity_type}/{field_name} already exists"
            )),
            StoreError::ConfigNotFound(id) => {
                ServiceError::NotFound(format!("config {id} not found"))
            }
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

impl From<EmbedderError> for ServiceError {
    fn from(err: EmbedderError) -> Self {
        ServiceError::EmbeddingProvider(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    /// Vector width; must match the provider's declared dimension.
    pub dimension: usize,
    /// Max number of in-flight provider calls across all operations.
    pub max_embed_concurrency: usize,
    pub chunking: ChunkingParams,
    /// How long an effective config may be served from cache.
    pub config_cache_ttl: Duration,
    /// Per-field candidate multiplier applied to the search limit.
    pub fetch_factor: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("target/demo/vectors.db"),
            dimension: GATEWAY_DEFAULTS.embedding_dimension,
            max_embed_concurrency: GATEWAY_DEFAULTS.max_concurrency,
            chunking: ChunkingParams::default(),
            config_cache_ttl: Duration::from_secs(300),
            fetch_factor: 10,
        }
    }
}

/// One record's text fields submitted for indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFields {
    pub record_key: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Restrict scoring to these fields; `None` means all enabled fields.
    pub fields: Option<Vec<String>>,
    /// Drop records whose total score falls below this floor.
    pub overall_threshold: Option<f64>,
}

/// Facade over chunking, embedding, and the vector store: indexes record
/// fields into chunk rows and serves weighted multi-field similarity search.
pub struct VectorSearchService {
    cfg: ServiceConfig,
    gateway: EmbeddingGateway,
    config_cache: TtlCache<(String, String, String), EffectiveConfig>,
}

impl VectorSearchService {
    pub fn new(cfg: ServiceConfig, provider: Arc<dyn Embedder>) -> Result<Self, ServiceError> {
        if cfg.dimension == 0 {
            return Err(ServiceError::Validation(
                "dimension must be positive".to_string(),
            ));
        }
        let provider_dimension = provider.info().dimension;
        if provider_dimension != cfg.dimension {
            return Err(ServiceError::Validation(format!(
                "provider dimension {provider_dimension} does not match configured dimension {}",
                cfg.dimension
            )));
        }
        if let Some(dir) = cfg.db_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ServiceError::Storage(e.to_string()))?;
        }
        let gateway = EmbeddingGateway::new(provider, cfg.max_embed_concurrency);
        let config_cache = TtlCache::new(cfg.config_cache_ttl);
        Ok(Self {
            cfg,
            gateway,
            config_cache,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    pub fn provider_info(&self) -> &EmbedderInfo {
        self.gateway.info()
    }

    /// Chunks and embeds every field of one record, then upserts the rows in
    /// a single batch write. Returns the number of chunk rows written.
    pub fn index_entity(
        &self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<usize, ServiceError> {
        validate_record_input(namespace, entity_type, record_key, fields)?;
        let chunks = self.build_chunks(namespace, entity_type, record_key, fields)?;
        let mut store = self.open_store()?;
        let written = store.batch_upsert(&chunks)?;
        tracing::info!(namespace, entity_type, record_key, chunks = written, "indexed record");
        Ok(written)
    }

    /// Replaces the record's full chunk set in one store transaction. All
    /// embedding happens first, so a provider failure leaves the previous
    /// generation intact. Safe to retry; repeated calls with identical
    /// fields converge on the same rows.
    pub fn reindex_entity(
        &self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<usize, ServiceError> {
        validate_record_input(namespace, entity_type, record_key, fields)?;
        let chunks = self.build_chunks(namespace, entity_type, record_key, fields)?;
        let mut store = self.open_store()?;
        let (deleted, inserted) =
            store.replace_record_chunks(namespace, entity_type, record_key, &chunks)?;
        tracing::info!(namespace, entity_type, record_key, deleted, inserted, "reindexed record");
        Ok(inserted)
    }

    /// Removes every chunk row of the record; returns the deleted count.
    pub fn delete_entity_index(
        &self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
    ) -> Result<usize, ServiceError> {
        validate_identity(namespace, entity_type, record_key)?;
        let mut store = self.open_store()?;
        let deleted = store.delete_by_filters(namespace, entity_type, record_key, None)?;
        tracing::info!(namespace, entity_type, record_key, deleted, "deleted record index");
        Ok(deleted)
    }

    /// Indexes many records through one store-level bulk write. Every record
    /// is validated before any chunking, embedding, or write occurs.
    pub fn index_entities_batch(
        &self,
        namespace: &str,
        entity_type: &str,
        records: &[EntityFields],
    ) -> Result<usize, ServiceError> {
        for record in records {
            validate_record_input(namespace, entity_type, &record.record_key, &record.fields)?;
        }
        if records.is_empty() {
            return Ok(0);
        }
        let mut chunks = Vec::new();
        for record in records {
            chunks.extend(self.build_chunks(
                namespace,
                entity_type,
                &record.record_key,
                &record.fields,
            )?);
        }
        let mut store = self.open_store()?;
        let written = store.batch_upsert(&chunks)?;
        tracing::info!(
            namespace,
            entity_type,
            records = records.len(),
            chunks = written,
            "indexed record batch"
        );
        Ok(written)
    }

    /// Weighted multi-field search over one (namespace, entityType).
    ///
    /// Scores each candidate record as the sum of its per-field best
    /// similarities multiplied by the field's weight; a field whose raw
    /// similarity falls below its own threshold contributes nothing but
    /// still shows up in the result's per-field map. A blank query yields
    /// an empty list without touching the provider.
    pub fn search(
        &self,
        namespace: &str,
        entity_type: &str,
        query: &str,
        limit: usize,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ServiceError> {
        require_non_blank("namespace", namespace)?;
        require_non_blank("entity type", entity_type)?;
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.open_store()?;
        let candidate_fields =
            self.candidate_fields(&store, namespace, entity_type, options.fields.as_deref())?;
        if candidate_fields.is_empty() {
            return Ok(Vec::new());
        }
        let query_vector = self.gateway.embed(query)?;
        let fetch_limit = limit.saturating_mul(self.cfg.fetch_factor.max(1));

        let mut totals: HashMap<String, f64> = HashMap::new();
        let mut per_field: HashMap<String, BTreeMap<String, f64>> = HashMap::new();
        for field in &candidate_fields {
            let config = self.effective_config_in(&store, namespace, entity_type, field)?;
            let hits = store.best_similarity_per_field(
                &query_vector,
                namespace,
                entity_type,
                Some(field),
                fetch_limit,
            )?;
            for hit in hits {
                per_field
                    .entry(hit.record_key.clone())
                    .or_default()
                    .insert(field.clone(), hit.similarity);
                let total = totals.entry(hit.record_key).or_insert(0.0);
                // Threshold compares the raw similarity, before weighting
                if hit.similarity >= config.threshold {
                    *total += hit.similarity * config.weight;
                }
            }
        }

        let mut results: Vec<SearchResult> = totals
            .into_iter()
            .map(|(record_key, total_score)| {
                let per_field_score = per_field.remove(&record_key).unwrap_or_default();
                SearchResult {
                    record_key,
                    total_score,
                    per_field_score,
                }
            })
            .collect();
        if let Some(floor) = options.overall_threshold {
            results.retain(|result| result.total_score >= floor);
        }
        results.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record_key.cmp(&b.record_key))
        });
        results.truncate(limit);
        tracing::debug!(namespace, entity_type, fields = candidate_fields.len(), hits = results.len(), "search completed");
        Ok(results)
    }

    /// Creates a per-field config; weight and threshold are range-checked
    /// before the store is touched.
    pub fn create_config(&self, new: &NewVectorConfig) -> Result<VectorConfig, ServiceError> {
        require_non_blank("namespace", &new.namespace)?;
        require_non_blank("entity type", &new.entity_type)?;
        require_non_blank("field name", &new.field_name)?;
        validate_weight(new.weight).map_err(ServiceError::Validation)?;
        validate_threshold(new.threshold).map_err(ServiceError::Validation)?;
        let mut store = self.open_store()?;
        let created = store.create_config(new)?;
        self.invalidate_cached(&created);
        Ok(created)
    }

    pub fn update_config(&self, id: i64, patch: &ConfigPatch) -> Result<VectorConfig, ServiceError> {
        if let Some(weight) = patch.weight {
            validate_weight(weight).map_err(ServiceError::Validation)?;
        }
        if let Some(threshold) = patch.threshold {
            validate_threshold(threshold).map_err(ServiceError::Validation)?;
        }
        let mut store = self.open_store()?;
        let updated = store.update_config(id, patch)?;
        self.invalidate_cached(&updated);
        Ok(updated)
    }

    pub fn delete_config(&self, id: i64) -> Result<VectorConfig, ServiceError> {
        let mut store = self.open_store()?;
        let removed = store.delete_config(id)?;
        self.invalidate_cached(&removed);
        Ok(removed)
    }

    pub fn find_config(&self, id: i64) -> Result<Option<VectorConfig>, ServiceError> {
        let store = self.open_store()?;
        Ok(store.find_config(id)?)
    }

    pub fn find_config_by_key(
        &self,
        namespace: &str,
        entity_type: &str,
        field_name: &str,
    ) -> Result<Option<VectorConfig>, ServiceError> {
        let store = self.open_store()?;
        Ok(store.find_config_by_key(namespace, entity_type, field_name)?)
    }

    pub fn find_all_configs(&self) -> Result<Vec<VectorConfig>, ServiceError> {
        let store = self.open_store()?;
        Ok(store.find_all_configs()?)
    }

    pub fn find_configs_by_filters(
        &self,
        filter: &ConfigFilter,
    ) -> Result<Vec<VectorConfig>, ServiceError> {
        let store = self.open_store()?;
        Ok(store.find_configs_by_filters(filter)?)
    }

    /// Effective config for a field: the stored row when present, otherwise
    /// the documented defaults (weight 1.0, threshold 0.0, enabled). Served
    /// from a TTL cache that config writes invalidate synchronously.
    pub fn effective_config(
        &self,
        namespace: &str,
        entity_type: &str,
        field_name: &str,
    ) -> Result<EffectiveConfig, ServiceError> {
        let store = self.open_store()?;
        self.effective_config_in(&store, namespace, entity_type, field_name)
    }

    fn effective_config_in(
        &self,
        store: &SqliteVectorStore,
        namespace: &str,
        entity_type: &str,
        field_name: &str,
    ) -> Result<EffectiveConfig, ServiceError> {
        let key = cache_key(namespace, entity_type, field_name);
        if let Some(cached) = self.config_cache.get(&key) {
            return Ok(cached);
        }
        let effective = match store.find_config_by_key(namespace, entity_type, field_name)? {
            Some(config) => EffectiveConfig::from(&config),
            None => EffectiveConfig::default(),
        };
        self.config_cache.insert(key, effective);
        Ok(effective)
    }

    fn invalidate_cached(&self, config: &VectorConfig) {
        self.config_cache.invalidate(&cache_key(
            &config.namespace,
            &config.entity_type,
            &config.field_name,
        ));
    }

    fn open_store(&self) -> Result<SqliteVectorStore, ServiceError> {
        let store = SqliteVectorStore::open(&self.cfg.db_path, self.cfg.dimension)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(store)
    }

    /// Fields eligible for scoring: the caller's requested fields (when
    /// given) intersected with the enabled-config set. A pair with no
    /// config rows at all falls back to the indexed field names, which
    /// then carry the default config.
    fn candidate_fields(
        &self,
        store: &SqliteVectorStore,
        namespace: &str,
        entity_type: &str,
        requested: Option<&[String]>,
    ) -> Result<Vec<String>, ServiceError> {
        let pool = if store.config_count(namespace, entity_type)? > 0 {
            store.list_enabled_fields(namespace, entity_type)?
        } else {
            store.list_indexed_fields(namespace, entity_type)?
        };
        let fields = match requested {
            Some(requested) => {
                let mut picked: Vec<String> = Vec::new();
                for field in requested {
                    if pool.iter().any(|candidate| candidate == field) && !picked.contains(field) {
                        picked.push(field.clone());
                    }
                }
                picked
            }
            None => pool,
        };
        Ok(fields)
    }

    fn build_chunks(
        &self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<VectorChunk>, ServiceError> {
        let mut pending: Vec<(String, Chunk)> = Vec::new();
        for (field_name, text) in fields {
            for chunk in chunk_text(text, &self.cfg.chunking) {
                pending.push((field_name.clone(), chunk));
            }
        }
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = pending.iter().map(|(_, chunk)| chunk.text.clone()).collect();
        let embeddings = self.embed_all(&texts)?;
        let now = Utc::now().to_rfc3339();
        let mut out = Vec::with_capacity(pending.len());
        for ((field_name, chunk), embedding) in pending.into_iter().zip(embeddings) {
            if embedding.len() != self.cfg.dimension {
                return Err(ServiceError::EmbeddingProvider(format!(
                    "provider returned dimension {}, expected {}",
                    embedding.len(),
                    self.cfg.dimension
                )));
            }
            out.push(VectorChunk {
                namespace: namespace.to_string(),
                entity_type: entity_type.to_string(),
                record_key: record_key.to_string(),
                field_name,
                chunk_index: chunk.index,
                text: chunk.text,
                embedding,
                start_position: chunk.start_position,
                end_position: chunk.end_position,
                metadata: BTreeMap::new(),
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        }
        Ok(out)
    }

    /// Embeds all texts through the gateway on a pool of scoped worker
    /// threads. The gateway's permit count still bounds provider calls;
    /// the first failure aborts remaining work and propagates.
    fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.cfg.max_embed_concurrency.clamp(1, texts.len());
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, &str)>();
        for (index, text) in texts.iter().enumerate() {
            let _ = job_tx.send((index, text.as_str()));
        }
        drop(job_tx);

        let (result_tx, result_rx) =
            crossbeam_channel::unbounded::<(usize, Result<Vec<f32>, EmbedderError>)>();
        let abort = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let abort = &abort;
                let gateway = &self.gateway;
                scope.spawn(move || {
                    while let Ok((index, text)) = job_rx.recv() {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        match gateway.embed(text) {
                            Ok(vector) => {
                                let _ = result_tx.send((index, Ok(vector)));
                            }
                            Err(err) => {
                                abort.store(true, Ordering::Relaxed);
                                let _ = result_tx.send((index, Err(err)));
                                break;
                            }
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for (index, outcome) in result_rx.iter() {
            slots[index] = Some(outcome?);
        }
        let mut out = Vec::with_capacity(texts.len());
        for slot in slots {
            match slot {
                Some(vector) => out.push(vector),
                None => {
                    return Err(ServiceError::EmbeddingProvider(
                        "provider returned no embedding for a chunk".to_string(),
                    ))
                }
            }
        }
        Ok(out)
    }
}

fn cache_key(namespace: &str, entity_type: &str, field_name: &str) -> (String, String, String) {
    (
        namespace.to_string(),
        entity_type.to_string(),
        field_name.to_string(),
    )
}

fn require_non_blank(label: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!(
            "{label} must not be blank"
        )));
    }
    Ok(())
}

fn validate_identity(
    namespace: &str,
    entity_type: &str,
    record_key: &str,
) -> Result<(), ServiceError> {
    require_non_blank("namespace", namespace)?;
    require_non_blank("entity type", entity_type)?;
    require_non_blank("record key", record_key)?;
    Ok(())
}

fn validate_record_input(
    namespace: &str,
    entity_type: &str,
    record_key: &str,
    fields: &BTreeMap<String, String>,
) -> Result<(), ServiceError> {
    validate_identity(namespace, entity_type, record_key)?;
    if fields.is_empty() {
        return Err(ServiceError::Validation(
            "fields map must not be empty".to_string(),
        ));
    }
    for field_name in fields.keys() {
        require_non_blank("field name", field_name)?;
    }
    Ok(())
}
