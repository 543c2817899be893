use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embedding_gateway::embedder::{Embedder, EmbedderError, EmbedderInfo, ProviderKind};
use tempfile::TempDir;
use vector_model::ChunkingParams;
use vector_search::{
    EntityFields, SearchOptions, ServiceConfig, ServiceError, VectorSearchService,
};
use vector_store::{ConfigFilter, ConfigPatch, ConfigStore, NewVectorConfig, SqliteVectorStore};

const NS: &str = "board";
const POST: &str = "post";

const VOCAB: &[&str] = &[
    "service", "tuning", "spring", "guide", "thread", "pool", "cache", "settings",
    "latency", "profile", "pasta", "cooking", "water", "salt", "home",
];
const DIM: usize = VOCAB.len() + 1;

/// Term-frequency embedder over a fixed vocabulary; words outside it share
/// one catch-all axis. Collision-free for in-vocabulary terms, so the
/// similarities asserted below are exact.
struct VocabEmbedder {
    info: EmbedderInfo,
    calls: AtomicUsize,
}

impl VocabEmbedder {
    fn new() -> Self {
        Self {
            info: EmbedderInfo {
                provider: ProviderKind::Http,
                embedding_model_id: "test-term-frequency".to_string(),
                dimension: DIM,
            },
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for VocabEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut output = vec![0f32; DIM];
        for word in text
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            let lowered = word.to_lowercase();
            let axis = VOCAB
                .iter()
                .position(|known| *known == lowered)
                .unwrap_or(VOCAB.len());
            output[axis] += 1.0;
        }
        let norm = output
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt();
        if norm > f64::EPSILON {
            for value in output.iter_mut() {
                *value = (f64::from(*value) / norm) as f32;
            }
        }
        Ok(output)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

struct FailingEmbedder {
    info: EmbedderInfo,
}

impl FailingEmbedder {
    fn new() -> Self {
        Self {
            info: EmbedderInfo {
                provider: ProviderKind::Http,
                embedding_model_id: "test-failing".to_string(),
                dimension: DIM,
            },
        }
    }
}

impl Embedder for FailingEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
        Err(EmbedderError::ProviderFailure {
            message: "provider offline".to_string(),
        })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

fn service_config(dir: &TempDir, chunking: ChunkingParams) -> ServiceConfig {
    ServiceConfig {
        db_path: dir.path().join("vectors.db"),
        dimension: DIM,
        max_embed_concurrency: 2,
        chunking,
        config_cache_ttl: Duration::from_secs(60),
        fetch_factor: 10,
    }
}

fn service_at(dir: &TempDir) -> (VectorSearchService, Arc<VocabEmbedder>) {
    service_with_chunking(dir, ChunkingParams::default())
}

fn service_with_chunking(
    dir: &TempDir,
    chunking: ChunkingParams,
) -> (VectorSearchService, Arc<VocabEmbedder>) {
    let provider = Arc::new(VocabEmbedder::new());
    let service = VectorSearchService::new(service_config(dir, chunking), provider.clone())
        .expect("construct service");
    (service, provider)
}

fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, text)| (name.to_string(), text.to_string()))
        .collect()
}

fn config_for(field_name: &str, weight: f64, threshold: f64, enabled: bool) -> NewVectorConfig {
    NewVectorConfig {
        namespace: NS.to_string(),
        entity_type: POST.to_string(),
        field_name: field_name.to_string(),
        weight,
        threshold,
        enabled,
    }
}

fn open_store(dir: &TempDir) -> SqliteVectorStore {
    SqliteVectorStore::open(dir.path().join("vectors.db"), DIM).expect("open store directly")
}

#[test]
fn indexing_persists_chunk_rows() {
    let dir = TempDir::new().expect("temp dir");
    let (service, provider) = service_at(&dir);
    let written = service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[
                ("title", "Spring service tuning guide"),
                ("content", "Thread pool and cache settings for the service."),
            ]),
        )
        .expect("index record");
    assert_eq!(written, 2);
    assert_eq!(provider.calls(), 2);

    let store = open_store(&dir);
    let rows = store.get_record_chunks(NS, POST, "42").expect("rows load");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.embedding.len() == DIM));
    let field_names: Vec<&str> = rows.iter().map(|row| row.field_name.as_str()).collect();
    assert_eq!(field_names, vec!["content", "title"]);
}

#[test]
fn validation_happens_before_any_side_effect() {
    let dir = TempDir::new().expect("temp dir");
    let (service, provider) = service_at(&dir);

    match service.index_entity(NS, POST, "  ", &fields(&[("title", "text")])) {
        Err(ServiceError::Validation(message)) => assert!(message.contains("record key")),
        other => panic!("unexpected result: {other:?}"),
    }
    match service.index_entity(NS, POST, "42", &BTreeMap::new()) {
        Err(ServiceError::Validation(message)) => assert!(message.contains("fields")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(provider.calls(), 0);
    let store = open_store(&dir);
    assert_eq!(store.chunk_count(NS, POST, None).expect("count"), 0);
}

#[test]
fn blank_query_skips_the_provider() {
    let dir = TempDir::new().expect("temp dir");
    let (service, provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "42", &fields(&[("title", "service tuning")]))
        .expect("index record");
    let calls_after_index = provider.calls();

    let results = service
        .search(NS, POST, "   ", 10, &SearchOptions::default())
        .expect("blank search");
    assert!(results.is_empty());
    assert_eq!(provider.calls(), calls_after_index);
}

#[test]
fn blank_field_text_contributes_zero_rows() {
    let dir = TempDir::new().expect("temp dir");
    let (service, provider) = service_at(&dir);
    let written = service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[("title", "service tuning guide"), ("summary", "   ")]),
        )
        .expect("index record");
    assert_eq!(written, 1);
    assert_eq!(provider.calls(), 1);

    // A record whose only field is blank indexes cleanly as zero rows
    let empty = service
        .index_entity(NS, POST, "7", &fields(&[("note", "   ")]))
        .expect("index blank record");
    assert_eq!(empty, 0);
    assert_eq!(provider.calls(), 1);

    let store = open_store(&dir);
    let rows = store.get_record_chunks(NS, POST, "42").expect("rows load");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field_name, "title");
    assert_eq!(store.chunk_count(NS, POST, Some("7")).expect("count"), 0);

    let results = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_key, "42");
    assert!(results[0].per_field_score.contains_key("title"));
    assert!(!results[0].per_field_score.contains_key("summary"));
}

#[test]
fn weighted_title_match_outranks_content_match() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .create_config(&config_for("title", 2.0, 0.0, true))
        .expect("title config");
    service
        .create_config(&config_for("content", 1.0, 0.0, true))
        .expect("content config");

    service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[
                ("title", "Spring service tuning guide"),
                ("content", "Thread pool and cache settings for the service."),
            ]),
        )
        .expect("index 42");
    service
        .index_entity(
            NS,
            POST,
            "7",
            &fields(&[
                ("title", "Cooking pasta at home"),
                ("content", "Boil water and add salt."),
            ]),
        )
        .expect("index 7");

    let results = service
        .search(NS, POST, "service tuning", 10, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].record_key, "42");

    let top = &results[0];
    let title_score = top.per_field_score["title"];
    let content_score = top.per_field_score["content"];
    assert!(
        (title_score - 0.7071).abs() < 1e-3,
        "title similarity {title_score}"
    );
    assert!(title_score > content_score);
    let expected_total = title_score * 2.0 + content_score;
    assert!((top.total_score - expected_total).abs() < 1e-9);

    assert_eq!(results[1].record_key, "7");
    assert!(results[1].total_score.abs() < 1e-6);
}

#[test]
fn equal_similarity_fields_scale_by_weight() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .create_config(&config_for("title", 2.0, 0.0, true))
        .expect("title config");
    service
        .create_config(&config_for("summary", 1.0, 0.0, true))
        .expect("summary config");
    service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[
                ("title", "cache latency profile"),
                ("summary", "cache latency profile"),
            ]),
        )
        .expect("index record");

    let results = service
        .search(NS, POST, "cache latency", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 1);
    let top = &results[0];
    let title_score = top.per_field_score["title"];
    let summary_score = top.per_field_score["summary"];
    assert!((title_score - summary_score).abs() < 1e-12);
    assert!((top.total_score - (title_score * 2.0 + summary_score)).abs() < 1e-12);
}

#[test]
fn below_threshold_field_is_reported_but_not_scored() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .create_config(&config_for("title", 1.0, 0.6, true))
        .expect("title config");
    service
        .create_config(&config_for("content", 1.0, 0.0, true))
        .expect("content config");
    service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[
                ("title", "Thread pool and cache settings for the service."),
                ("content", "Spring service tuning guide"),
            ]),
        )
        .expect("index record");

    let results = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 1);
    let top = &results[0];
    let title_score = top.per_field_score["title"];
    assert!(
        title_score > 0.0 && title_score < 0.6,
        "title similarity {title_score}"
    );
    let content_score = top.per_field_score["content"];
    assert!((top.total_score - content_score).abs() < 1e-12);
}

#[test]
fn overall_threshold_drops_low_scoring_records() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "42", &fields(&[("title", "Spring service tuning guide")]))
        .expect("index 42");
    service
        .index_entity(NS, POST, "7", &fields(&[("title", "Cooking pasta at home")]))
        .expect("index 7");

    let options = SearchOptions {
        overall_threshold: Some(0.5),
        ..SearchOptions::default()
    };
    let results = service
        .search(NS, POST, "service tuning", 10, &options)
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_key, "42");
}

#[test]
fn search_without_configs_uses_indexed_fields() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "42", &fields(&[("title", "service tuning guide")]))
        .expect("index record");

    let results = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_key, "42");
    assert!(results[0].per_field_score.contains_key("title"));
}

#[test]
fn disabled_field_is_excluded_from_search() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .create_config(&config_for("title", 1.0, 0.0, true))
        .expect("title config");
    service
        .create_config(&config_for("content", 1.0, 0.0, false))
        .expect("content config");
    service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[("title", "pasta cooking"), ("content", "service tuning guide")]),
        )
        .expect("index record");

    let results = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search");
    // content matches the query but only the enabled title field is scanned
    assert_eq!(results.len(), 1);
    let top = &results[0];
    assert!(!top.per_field_score.contains_key("content"));
    assert!(top.total_score.abs() < 1e-6);
}

#[test]
fn requested_fields_intersect_enabled_set() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .create_config(&config_for("title", 1.0, 0.0, true))
        .expect("title config");
    service
        .create_config(&config_for("content", 1.0, 0.0, true))
        .expect("content config");
    service
        .index_entity(
            NS,
            POST,
            "42",
            &fields(&[
                ("title", "service tuning guide"),
                ("content", "service tuning notes"),
            ]),
        )
        .expect("index record");

    let options = SearchOptions {
        fields: Some(vec!["content".to_string(), "missing".to_string()]),
        ..SearchOptions::default()
    };
    let results = service
        .search(NS, POST, "service tuning", 5, &options)
        .expect("search");
    assert_eq!(results.len(), 1);
    let top = &results[0];
    assert!(top.per_field_score.contains_key("content"));
    assert!(!top.per_field_score.contains_key("title"));
}

#[test]
fn reindex_converges_on_the_same_rows() {
    let dir = TempDir::new().expect("temp dir");
    let chunking = ChunkingParams {
        max_tokens_per_chunk: 50,
        target_tokens_per_chunk: 8,
        overlap_tokens: 2,
        min_tokens: 2,
    };
    let (service, _provider) = service_with_chunking(&dir, chunking);
    let body = "Tune the pool. Warm the cache. Trim the logs. Batch the writes. Shed the load.";

    let first = service
        .reindex_entity(NS, POST, "42", &fields(&[("content", body)]))
        .expect("first reindex");
    let second = service
        .reindex_entity(NS, POST, "42", &fields(&[("content", body)]))
        .expect("second reindex");
    assert_eq!(first, second);
    assert!(first > 1, "expected multiple chunks, got {first}");

    let store = open_store(&dir);
    let rows = store.get_record_chunks(NS, POST, "42").expect("rows load");
    assert_eq!(rows.len(), second);
    let identities: Vec<(String, u32)> = rows
        .iter()
        .map(|row| (row.field_name.clone(), row.chunk_index))
        .collect();
    let expected: Vec<(String, u32)> = (0..rows.len() as u32)
        .map(|index| ("content".to_string(), index))
        .collect();
    assert_eq!(identities, expected);
}

#[test]
fn deleted_record_never_surfaces_again() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "42", &fields(&[("title", "service tuning guide")]))
        .expect("index record");
    let found = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(found.len(), 1);

    let deleted = service.delete_entity_index(NS, POST, "42").expect("delete");
    assert_eq!(deleted, 1);
    let after = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search again");
    assert!(after.is_empty());
}

#[test]
fn batch_indexing_writes_all_records_at_once() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    let records = vec![
        EntityFields {
            record_key: "1".to_string(),
            fields: fields(&[("title", "cache tuning")]),
        },
        EntityFields {
            record_key: "2".to_string(),
            fields: fields(&[("title", "pasta cooking")]),
        },
    ];
    let written = service
        .index_entities_batch(NS, POST, &records)
        .expect("batch index");
    assert_eq!(written, 2);
    let store = open_store(&dir);
    assert_eq!(store.chunk_count(NS, POST, None).expect("count"), 2);

    let empty: Vec<EntityFields> = Vec::new();
    assert_eq!(
        service.index_entities_batch(NS, POST, &empty).expect("empty batch"),
        0
    );
}

#[test]
fn batch_with_one_invalid_record_writes_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let (service, provider) = service_at(&dir);
    let records = vec![
        EntityFields {
            record_key: "1".to_string(),
            fields: fields(&[("title", "cache tuning")]),
        },
        EntityFields {
            record_key: " ".to_string(),
            fields: fields(&[("title", "pasta")]),
        },
    ];
    match service.index_entities_batch(NS, POST, &records) {
        Err(ServiceError::Validation(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(provider.calls(), 0);
    let store = open_store(&dir);
    assert_eq!(store.chunk_count(NS, POST, None).expect("count"), 0);
}

#[test]
fn config_crud_maps_store_errors() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    let created = service
        .create_config(&config_for("title", 2.0, 0.1, true))
        .expect("create config");

    match service.create_config(&config_for("title", 1.0, 0.0, true)) {
        Err(ServiceError::Conflict(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    match service.update_config(created.id + 999, &ConfigPatch::default()) {
        Err(ServiceError::NotFound(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    match service.create_config(&config_for("content", 0.05, 0.0, true)) {
        Err(ServiceError::Validation(message)) => assert!(message.contains("weight")),
        other => panic!("unexpected result: {other:?}"),
    }
    match service.update_config(
        created.id,
        &ConfigPatch {
            threshold: Some(1.5),
            ..ConfigPatch::default()
        },
    ) {
        Err(ServiceError::Validation(message)) => assert!(message.contains("threshold")),
        other => panic!("unexpected result: {other:?}"),
    }

    let listed = service
        .find_configs_by_filters(&ConfigFilter {
            entity_type: Some(POST.to_string()),
            ..ConfigFilter::default()
        })
        .expect("filtered listing");
    assert_eq!(listed.len(), 1);

    let removed = service.delete_config(created.id).expect("delete config");
    assert_eq!(removed.id, created.id);
    assert!(service.find_config(created.id).expect("lookup").is_none());
}

#[test]
fn effective_config_defaults_and_cache_invalidation() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);

    let effective = service.effective_config(NS, POST, "title").expect("defaults");
    assert_eq!(effective.weight, 1.0);
    assert_eq!(effective.threshold, 0.0);
    assert!(effective.enabled);

    let created = service
        .create_config(&config_for("title", 1.5, 0.2, true))
        .expect("create config");
    let effective = service
        .effective_config(NS, POST, "title")
        .expect("read after create");
    assert_eq!(effective.weight, 1.5);

    // A write behind the service's back stays invisible until the TTL passes
    {
        let mut store = open_store(&dir);
        store
            .update_config(
                created.id,
                &ConfigPatch {
                    weight: Some(3.0),
                    ..ConfigPatch::default()
                },
            )
            .expect("direct update");
    }
    let cached = service
        .effective_config(NS, POST, "title")
        .expect("cached read");
    assert_eq!(cached.weight, 1.5);

    // A service-level write invalidates synchronously
    service
        .update_config(
            created.id,
            &ConfigPatch {
                threshold: Some(0.3),
                ..ConfigPatch::default()
            },
        )
        .expect("service update");
    let fresh = service
        .effective_config(NS, POST, "title")
        .expect("fresh read");
    assert_eq!(fresh.weight, 3.0);
    assert_eq!(fresh.threshold, 0.3);
}

#[test]
fn equal_totals_order_by_record_key() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "beta", &fields(&[("title", "cache tuning")]))
        .expect("index beta");
    service
        .index_entity(NS, POST, "alpha", &fields(&[("title", "cache tuning")]))
        .expect("index alpha");

    let results = service
        .search(NS, POST, "cache tuning", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].record_key, "alpha");
    assert_eq!(results[1].record_key, "beta");
    assert!((results[0].total_score - results[1].total_score).abs() < 1e-12);
}

#[test]
fn limit_truncates_ranked_results() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "a", &fields(&[("title", "service tuning guide")]))
        .expect("index a");
    service
        .index_entity(NS, POST, "b", &fields(&[("title", "service notes")]))
        .expect("index b");
    service
        .index_entity(NS, POST, "c", &fields(&[("title", "pasta")]))
        .expect("index c");

    let results = service
        .search(NS, POST, "service tuning", 2, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].record_key, "a");
    assert_eq!(results[1].record_key, "b");
    assert!(results[0].total_score > results[1].total_score);
}

#[test]
fn provider_failure_keeps_the_previous_generation() {
    let dir = TempDir::new().expect("temp dir");
    let (service, _provider) = service_at(&dir);
    service
        .index_entity(NS, POST, "42", &fields(&[("title", "service tuning guide")]))
        .expect("seed index");

    let failing = VectorSearchService::new(
        service_config(&dir, ChunkingParams::default()),
        Arc::new(FailingEmbedder::new()),
    )
    .expect("construct failing service");
    match failing.reindex_entity(NS, POST, "42", &fields(&[("title", "replacement text")])) {
        Err(ServiceError::EmbeddingProvider(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    let results = service
        .search(NS, POST, "service tuning", 5, &SearchOptions::default())
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_key, "42");
}

#[test]
fn provider_dimension_mismatch_is_rejected_at_construction() {
    let dir = TempDir::new().expect("temp dir");
    let cfg = ServiceConfig {
        dimension: DIM + 1,
        ..service_config(&dir, ChunkingParams::default())
    };
    let err = VectorSearchService::new(cfg, Arc::new(VocabEmbedder::new()))
        .map(|_| ())
        .expect_err("construction must fail");
    match err {
        ServiceError::Validation(message) => assert!(message.contains("dimension")),
        other => panic!("unexpected error: {other:?}"),
    }
}
