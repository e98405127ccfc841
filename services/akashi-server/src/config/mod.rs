use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database_url: String,

    // Ed25519 key material; an ephemeral pair is generated when unset.
    #[serde(default)]
    pub jwt_private_key_path: Option<String>,
    #[serde(default)]
    pub jwt_public_key_path: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: i64,
    #[serde(default = "default_scoped_ttl_cap")]
    pub scoped_token_max_ttl_seconds: i64,

    // One-time bootstrap secret for the seed "admin" agent.
    #[serde(default)]
    pub bootstrap_admin_key: Option<String>,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub client_request_timeout_ms: u64,
    #[serde(default)]
    pub cors_origins: Option<String>,

    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: i64,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_buffer_high_water")]
    pub buffer_high_water: usize,
    #[serde(default = "default_buffer_flush_interval_ms")]
    pub buffer_flush_interval_ms: u64,

    // Token-bucket rules per route prefix.
    #[serde(default = "default_auth_rate")]
    pub rate_limit_auth_per_sec: u32,
    #[serde(default = "default_auth_burst")]
    pub rate_limit_auth_burst: u32,
    #[serde(default = "default_ingest_rate")]
    pub rate_limit_ingest_per_sec: u32,
    #[serde(default = "default_ingest_burst")]
    pub rate_limit_ingest_burst: u32,
    #[serde(default = "default_query_rate")]
    pub rate_limit_query_per_sec: u32,
    #[serde(default = "default_query_burst")]
    pub rate_limit_query_burst: u32,
    #[serde(default = "default_search_rate")]
    pub rate_limit_search_per_sec: u32,
    #[serde(default = "default_search_burst")]
    pub rate_limit_search_burst: u32,

    // Conflict scorer: "ollama", "openai" or "none".
    #[serde(default = "default_provider_none")]
    pub validator_provider: String,
    #[serde(default = "default_ollama_url")]
    pub validator_url: String,
    #[serde(default = "default_validator_model")]
    pub validator_model: String,
    #[serde(default)]
    pub validator_api_key: Option<String>,

    // Embeddings: "http" or "none".
    #[serde(default = "default_provider_none")]
    pub embedder_provider: String,
    #[serde(default = "default_embedder_url")]
    pub embedder_url: String,
    #[serde(default = "default_embedder_model")]
    pub embedder_model: String,

    #[serde(default = "default_topic_floor")]
    pub topic_similarity_floor: f64,
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: f64,
    #[serde(default = "default_decay_half_life")]
    pub temporal_decay_half_life_hours: f64,
    #[serde(default = "default_candidate_window")]
    pub scorer_candidate_window: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("AKASHI_").from_env::<Self>()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_token_ttl() -> i64 {
    3600
}
fn default_scoped_ttl_cap() -> i64 {
    3600
}
fn default_max_body_bytes() -> usize {
    1_048_576
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_idempotency_ttl() -> i64 {
    600
}
fn default_buffer_capacity() -> usize {
    4096
}
fn default_buffer_high_water() -> usize {
    256
}
fn default_buffer_flush_interval_ms() -> u64 {
    200
}
fn default_auth_rate() -> u32 {
    5
}
fn default_auth_burst() -> u32 {
    10
}
fn default_ingest_rate() -> u32 {
    200
}
fn default_ingest_burst() -> u32 {
    400
}
fn default_query_rate() -> u32 {
    50
}
fn default_query_burst() -> u32 {
    100
}
fn default_search_rate() -> u32 {
    10
}
fn default_search_burst() -> u32 {
    20
}
fn default_provider_none() -> String {
    "none".to_string()
}
fn default_ollama_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_validator_model() -> String {
    "llama3.1".to_string()
}
fn default_embedder_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_embedder_model() -> String {
    "mxbai-embed-large".to_string()
}
fn default_topic_floor() -> f64 {
    0.70
}
fn default_significance_threshold() -> f64 {
    0.35
}
fn default_decay_half_life() -> f64 {
    168.0
}
fn default_candidate_window() -> i64 {
    200
}
