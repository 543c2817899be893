use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use vector_model::{VectorChunk, VectorConfig};

use crate::{
    ChunkStore, ConfigFilter, ConfigPatch, ConfigStore, FieldSimilarity, NewVectorConfig,
    RecordSimilarity, StoreError,
};

/// SQLite-backed store for vector chunks and field configs.
pub struct SqliteVectorStore {
    conn: Connection,
    dimension: usize,
}

impl SqliteVectorStore {
    /// Open an in-memory store and initialize schema.
    pub fn new(dimension: usize) -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory sqlite");
        let store = Self { conn, dimension };
        store.init().expect("initialize schema");
        store
    }

    /// Open a file-backed store at `path` and initialize schema if absent.
    pub fn open<P: AsRef<Path>>(path: P, dimension: usize) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn, dimension };
        store.init()?;
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn init(&self) -> rusqlite::Result<()> {
        // Pragmas for durability and concurrency
        self.conn.pragma_update(None, "journal_mode", &"WAL")?;
        self.conn.pragma_update(None, "synchronous", &"FULL")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vector_chunks (
                rowid INTEGER PRIMARY KEY,
                namespace TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                record_key TEXT NOT NULL,
                field_name TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                embedding_dimension INTEGER NOT NULL,
                start_position INTEGER NOT NULL,
                end_position INTEGER NOT NULL,
                meta_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_vector_chunks_identity
                ON vector_chunks(namespace, entity_type, record_key, field_name, chunk_index);
            CREATE INDEX IF NOT EXISTS idx_vector_chunks_scope
                ON vector_chunks(namespace, entity_type, field_name);

            CREATE TABLE IF NOT EXISTS vector_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                field_name TEXT NOT NULL,
                weight REAL NOT NULL,
                threshold REAL NOT NULL,
                enabled INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_vector_configs_key
                ON vector_configs(namespace, entity_type, field_name);
            "#,
        )?;
        Ok(())
    }

    /// Chunk rows of one record, ordered by (field_name, chunk_index).
    pub fn get_record_chunks(
        &self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
    ) -> Result<Vec<VectorChunk>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT namespace, entity_type, record_key, field_name, chunk_index, text, \
             embedding, embedding_dimension, start_position, end_position, meta_json, \
             created_at, updated_at \
             FROM vector_chunks \
             WHERE namespace = ?1 AND entity_type = ?2 AND record_key = ?3 \
             ORDER BY field_name, chunk_index",
        )?;
        let rows = stmt.query_map(params![namespace, entity_type, record_key], chunk_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(chunk_from_row(row?)?);
        }
        Ok(out)
    }

    /// Distinct field names with at least one chunk under (namespace, entity_type).
    pub fn list_indexed_fields(
        &self,
        namespace: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT field_name FROM vector_chunks \
             WHERE namespace = ?1 AND entity_type = ?2 ORDER BY field_name",
        )?;
        let rows = stmt.query_map(params![namespace, entity_type], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Chunk row count for a (namespace, entity_type), optionally one record.
    pub fn chunk_count(
        &self,
        namespace: &str,
        entity_type: &str,
        record_key: Option<&str>,
    ) -> Result<i64, StoreError> {
        let count = match record_key {
            Some(key) => self.conn.query_row(
                "SELECT count(*) FROM vector_chunks \
                 WHERE namespace = ?1 AND entity_type = ?2 AND record_key = ?3",
                params![namespace, entity_type, key],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT count(*) FROM vector_chunks WHERE namespace = ?1 AND entity_type = ?2",
                params![namespace, entity_type],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// Config row count under (namespace, entity_type), regardless of the
    /// enabled flag.
    pub fn config_count(&self, namespace: &str, entity_type: &str) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT count(*) FROM vector_configs WHERE namespace = ?1 AND entity_type = ?2",
            params![namespace, entity_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn validate_query_vector(&self, query: &[f32]) -> Result<(), StoreError> {
        if query.len() != self.dimension {
            return Err(StoreError::InvalidVector(format!(
                "query dimension {} does not match store dimension {}",
                query.len(),
                self.dimension
            )));
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidVector(
                "query vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    fn scan_similarities(
        &self,
        query: &[f32],
        namespace: &str,
        entity_type: &str,
        field_name: Option<&str>,
    ) -> Result<Vec<(String, String, f64)>, StoreError> {
        let mut sql = String::from(
            "SELECT record_key, field_name, embedding FROM vector_chunks \
             WHERE namespace = ? AND entity_type = ? AND embedding_dimension = ?",
        );
        let mut args: Vec<rusqlite::types::Value> = vec![
            namespace.to_string().into(),
            entity_type.to_string().into(),
            (self.dimension as i64).into(),
        ];
        if let Some(field) = field_name {
            sql.push_str(" AND field_name = ?");
            args.push(field.to_string().into());
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.into_iter()), |row| {
            let record_key: String = row.get(0)?;
            let field: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            Ok((record_key, field, blob))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (record_key, field, blob) = row?;
            let embedding = decode_embedding(&blob, self.dimension)?;
            if let Some(similarity) = cosine_similarity(query, &embedding) {
                out.push((record_key, field, similarity));
            }
        }
        Ok(out)
    }
}

impl ChunkStore for SqliteVectorStore {
    fn batch_upsert(&mut self, chunks: &[VectorChunk]) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let dimension = self.dimension;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let written = upsert_chunks_tx(&tx, chunks, dimension)?;
        tx.commit()?;
        tracing::debug!(rows = written, "upserted chunk batch");
        Ok(written)
    }

    fn delete_by_filters(
        &mut self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        field_name: Option<&str>,
    ) -> Result<usize, StoreError> {
        let mut sql = String::from(
            "DELETE FROM vector_chunks \
             WHERE namespace = ? AND entity_type = ? AND record_key = ?",
        );
        let mut args: Vec<rusqlite::types::Value> = vec![
            namespace.to_string().into(),
            entity_type.to_string().into(),
            record_key.to_string().into(),
        ];
        if let Some(field) = field_name {
            sql.push_str(" AND field_name = ?");
            args.push(field.to_string().into());
        }
        let deleted = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(args.into_iter()))?;
        tracing::debug!(
            namespace,
            entity_type,
            record_key,
            field = field_name,
            deleted,
            "deleted chunk rows"
        );
        Ok(deleted)
    }

    fn replace_record_chunks(
        &mut self,
        namespace: &str,
        entity_type: &str,
        record_key: &str,
        chunks: &[VectorChunk],
    ) -> Result<(usize, usize), StoreError> {
        let dimension = self.dimension;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            "DELETE FROM vector_chunks \
             WHERE namespace = ?1 AND entity_type = ?2 AND record_key = ?3",
            params![namespace, entity_type, record_key],
        )?;
        let inserted = upsert_chunks_tx(&tx, chunks, dimension)?;
        tx.commit()?;
        tracing::debug!(namespace, entity_type, record_key, deleted, inserted, "replaced record chunks");
        Ok((deleted, inserted))
    }

    fn best_similarity_per_field(
        &self,
        query: &[f32],
        namespace: &str,
        entity_type: &str,
        field_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FieldSimilarity>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.validate_query_vector(query)?;
        let mut best: HashMap<(String, String), f64> = HashMap::new();
        for (record_key, field, similarity) in
            self.scan_similarities(query, namespace, entity_type, field_name)?
        {
            best.entry((record_key, field))
                .and_modify(|current| {
                    if similarity > *current {
                        *current = similarity;
                    }
                })
                .or_insert(similarity);
        }
        let mut hits: Vec<FieldSimilarity> = best
            .into_iter()
            .map(|((record_key, field), similarity)| FieldSimilarity {
                record_key,
                field_name: field,
                similarity,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record_key.cmp(&b.record_key))
                .then_with(|| a.field_name.cmp(&b.field_name))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn best_similarity_per_record(
        &self,
        query: &[f32],
        namespace: &str,
        entity_type: &str,
        limit: usize,
    ) -> Result<Vec<RecordSimilarity>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.validate_query_vector(query)?;
        let mut best: HashMap<String, f64> = HashMap::new();
        for (record_key, _field, similarity) in
            self.scan_similarities(query, namespace, entity_type, None)?
        {
            best.entry(record_key)
                .and_modify(|current| {
                    if similarity > *current {
                        *current = similarity;
                    }
                })
                .or_insert(similarity);
        }
        let mut hits: Vec<RecordSimilarity> = best
            .into_iter()
            .map(|(record_key, similarity)| RecordSimilarity {
                record_key,
                similarity,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record_key.cmp(&b.record_key))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

impl ConfigStore for SqliteVectorStore {
    fn create_config(&mut self, new: &NewVectorConfig) -> Result<VectorConfig, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = self.conn.execute(
            "INSERT INTO vector_configs \
             (namespace, entity_type, field_name, weight, threshold, enabled, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.namespace,
                new.entity_type,
                new.field_name,
                new.weight,
                new.threshold,
                new.enabled as i64,
                now,
                now,
            ],
        );
        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::ConfigExists {
                    namespace: new.namespace.clone(),
                    entity_type: new.entity_type.clone(),
                    field_name: new.field_name.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, namespace = %new.namespace, entity_type = %new.entity_type, field = %new.field_name, "created vector config");
        Ok(VectorConfig {
            id,
            namespace: new.namespace.clone(),
            entity_type: new.entity_type.clone(),
            field_name: new.field_name.clone(),
            weight: new.weight,
            threshold: new.threshold,
            enabled: new.enabled,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    fn update_config(&mut self, id: i64, patch: &ConfigPatch) -> Result<VectorConfig, StoreError> {
        let Some(mut config) = self.find_config(id)? else {
            return Err(StoreError::ConfigNotFound(id));
        };
        if let Some(weight) = patch.weight {
            config.weight = weight;
        }
        if let Some(threshold) = patch.threshold {
            config.threshold = threshold;
        }
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        config.updated_at = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE vector_configs SET weight = ?1, threshold = ?2, enabled = ?3, updated_at = ?4 \
             WHERE id = ?5",
            params![
                config.weight,
                config.threshold,
                config.enabled as i64,
                config.updated_at,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ConfigNotFound(id));
        }
        Ok(config)
    }

    fn delete_config(&mut self, id: i64) -> Result<VectorConfig, StoreError> {
        let Some(config) = self.find_config(id)? else {
            return Err(StoreError::ConfigNotFound(id));
        };
        let removed = self
            .conn
            .execute("DELETE FROM vector_configs WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::ConfigNotFound(id));
        }
        Ok(config)
    }

    fn find_config(&self, id: i64) -> Result<Option<VectorConfig>, StoreError> {
        let config = self
            .conn
            .query_row(
                "SELECT id, namespace, entity_type, field_name, weight, threshold, enabled, \
                 created_at, updated_at FROM vector_configs WHERE id = ?1",
                params![id],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    fn find_config_by_key(
        &self,
        namespace: &str,
        entity_type: &str,
        field_name: &str,
    ) -> Result<Option<VectorConfig>, StoreError> {
        let config = self
            .conn
            .query_row(
                "SELECT id, namespace, entity_type, field_name, weight, threshold, enabled, \
                 created_at, updated_at FROM vector_configs \
                 WHERE namespace = ?1 AND entity_type = ?2 AND field_name = ?3",
                params![namespace, entity_type, field_name],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    fn find_all_configs(&self) -> Result<Vec<VectorConfig>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, namespace, entity_type, field_name, weight, threshold, enabled, \
             created_at, updated_at FROM vector_configs \
             ORDER BY namespace, entity_type, field_name",
        )?;
        let rows = stmt.query_map([], config_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn find_configs_by_filters(
        &self,
        filter: &ConfigFilter,
    ) -> Result<Vec<VectorConfig>, StoreError> {
        let mut sql = String::from(
            "SELECT id, namespace, entity_type, field_name, weight, threshold, enabled, \
             created_at, updated_at FROM vector_configs WHERE 1=1",
        );
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(entity_type) = &filter.entity_type {
            sql.push_str(" AND entity_type = ?");
            args.push(entity_type.clone().into());
        }
        if let Some(field_name) = &filter.field_name {
            sql.push_str(" AND field_name = ?");
            args.push(field_name.clone().into());
        }
        if let Some(enabled) = filter.enabled {
            sql.push_str(" AND enabled = ?");
            args.push((enabled as i64).into());
        }
        sql.push_str(" ORDER BY namespace, entity_type, field_name");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.into_iter()), config_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn list_enabled_fields(
        &self,
        namespace: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT field_name FROM vector_configs \
             WHERE namespace = ?1 AND entity_type = ?2 AND enabled = 1 \
             ORDER BY field_name",
        )?;
        let rows = stmt.query_map(params![namespace, entity_type], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn upsert_chunks_tx(
    tx: &rusqlite::Transaction<'_>,
    chunks: &[VectorChunk],
    dimension: usize,
) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO vector_chunks (
            namespace, entity_type, record_key, field_name, chunk_index,
            text, embedding, embedding_dimension, start_position, end_position,
            meta_json, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(namespace, entity_type, record_key, field_name, chunk_index) DO UPDATE SET
            text=excluded.text,
            embedding=excluded.embedding,
            embedding_dimension=excluded.embedding_dimension,
            start_position=excluded.start_position,
            end_position=excluded.end_position,
            meta_json=excluded.meta_json,
            updated_at=excluded.updated_at
        "#,
    )?;
    for chunk in chunks {
        let blob = encode_embedding(&chunk.embedding, dimension)?;
        let meta_json =
            serde_json::to_string(&chunk.metadata).unwrap_or_else(|_| "{}".to_string());
        stmt.execute(params![
            chunk.namespace,
            chunk.entity_type,
            chunk.record_key,
            chunk.field_name,
            chunk.chunk_index as i64,
            chunk.text,
            blob,
            dimension as i64,
            chunk.start_position as i64,
            chunk.end_position as i64,
            meta_json,
            chunk.created_at,
            chunk.updated_at,
        ])?;
    }
    Ok(chunks.len())
}

struct ChunkRow {
    namespace: String,
    entity_type: String,
    record_key: String,
    field_name: String,
    chunk_index: i64,
    text: String,
    embedding: Vec<u8>,
    embedding_dimension: i64,
    start_position: i64,
    end_position: i64,
    meta_json: String,
    created_at: String,
    updated_at: String,
}

fn chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        namespace: row.get(0)?,
        entity_type: row.get(1)?,
        record_key: row.get(2)?,
        field_name: row.get(3)?,
        chunk_index: row.get(4)?,
        text: row.get(5)?,
        embedding: row.get(6)?,
        embedding_dimension: row.get(7)?,
        start_position: row.get(8)?,
        end_position: row.get(9)?,
        meta_json: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn chunk_from_row(raw: ChunkRow) -> Result<VectorChunk, StoreError> {
    let dimension = usize::try_from(raw.embedding_dimension).map_err(|_| {
        StoreError::InvalidDbValue(format!(
            "embedding_dimension {} is not a valid dimension",
            raw.embedding_dimension
        ))
    })?;
    let embedding = decode_embedding(&raw.embedding, dimension)?;
    let chunk_index = u32::try_from(raw.chunk_index).map_err(|_| {
        StoreError::InvalidDbValue(format!("chunk_index {} out of range", raw.chunk_index))
    })?;
    let start_position = usize::try_from(raw.start_position).map_err(|_| {
        StoreError::InvalidDbValue(format!("start_position {} out of range", raw.start_position))
    })?;
    let end_position = usize::try_from(raw.end_position).map_err(|_| {
        StoreError::InvalidDbValue(format!("end_position {} out of range", raw.end_position))
    })?;
    let metadata = serde_json::from_str(&raw.meta_json).unwrap_or_default();
    Ok(VectorChunk {
        namespace: raw.namespace,
        entity_type: raw.entity_type,
        record_key: raw.record_key,
        field_name: raw.field_name,
        chunk_index,
        text: raw.text,
        embedding,
        start_position,
        end_position,
        metadata,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

fn config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorConfig> {
    let enabled: i64 = row.get(6)?;
    Ok(VectorConfig {
        id: row.get(0)?,
        namespace: row.get(1)?,
        entity_type: row.get(2)?,
        field_name: row.get(3)?,
        weight: row.get(4)?,
        threshold: row.get(5)?,
        enabled: enabled != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
}

fn encode_embedding(vector: &[f32], dimension: usize) -> Result<Vec<u8>, StoreError> {
    if vector.len() != dimension {
        return Err(StoreError::InvalidVector(format!(
            "expected dimension {dimension}, got {}",
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidVector(
            "vector contains non-finite values".to_string(),
        ));
    }
    let bytes: &[u8] = bytemuck::cast_slice(vector);
    Ok(bytes.to_vec())
}

fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    let expected = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected {
        return Err(StoreError::InvalidDbValue(format!(
            "embedding blob holds {} bytes, dimension {dimension} needs {expected}",
            blob.len()
        )));
    }
    let mut out = vec![0f32; dimension];
    let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
    out_bytes.copy_from_slice(blob);
    Ok(out)
}

/// Cosine similarity in f64; `None` when either vector has (near) zero norm.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}
