use crate::embedder::HttpEmbedderConfig;

/// Default settings for the embedding gateway and its provider.
#[derive(Debug, Clone, Copy)]
pub struct GatewayDefaults {
    pub endpoint: &'static str,
    pub embedding_dimension: usize,
    pub max_input_chars: usize,
    pub embedding_model_id: &'static str,
    /// Permit count; the provider's own concurrency ceiling.
    pub max_concurrency: usize,
}

/// Shared defaults so services and tests stay in sync.
pub const GATEWAY_DEFAULTS: GatewayDefaults = GatewayDefaults {
    endpoint: "http://127.0.0.1:8089/v1/embeddings",
    embedding_dimension: 768,
    max_input_chars: 8192,
    embedding_model_id: "board-embed-768",
    max_concurrency: 3,
};

/// Convenience helper to build an [`HttpEmbedderConfig`] from the shared
/// defaults.
pub fn default_http_config() -> HttpEmbedderConfig {
    HttpEmbedderConfig {
        endpoint: GATEWAY_DEFAULTS.endpoint.to_string(),
        auth_token: None,
        dimension: GATEWAY_DEFAULTS.embedding_dimension,
        max_input_length: GATEWAY_DEFAULTS.max_input_chars,
        embedding_model_id: GATEWAY_DEFAULTS.embedding_model_id.to_string(),
    }
}
