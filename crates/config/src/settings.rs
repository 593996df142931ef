//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{endpoints, expansion, indexing, jobs, retrieval, synthesis, timeouts};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub expansion: ExpansionConfig,

    #[serde(default)]
    pub sparse: SparseConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub rerank: RerankConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Vector dimension D; every current chunk embedding must match
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
    #[serde(default = "default_embedder_timeout")]
    pub timeout_secs: u64,
    /// Chunks embedded per request during indexing
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,
}

fn default_embedding_endpoint() -> String {
    endpoints::OLLAMA_DEFAULT.clone()
}
fn default_embedding_model() -> String {
    "qwen3-embedding:0.6b".to_string()
}
fn default_vector_dim() -> usize {
    1024
}
fn default_embedder_timeout() -> u64 {
    timeouts::EMBEDDER_SECS
}
fn default_embed_batch() -> usize {
    indexing::EMBED_BATCH
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            vector_dim: default_vector_dim(),
            timeout_secs: default_embedder_timeout(),
            batch_size: default_embed_batch(),
        }
    }
}

/// Query expansion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_expansion_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_ja_count")]
    pub ja_count: usize,
    #[serde(default = "default_en_count")]
    pub en_count: usize,
    #[serde(default = "default_expansion_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_expansion_endpoint() -> String {
    endpoints::EXPANSION_DEFAULT.clone()
}
fn default_ja_count() -> usize {
    expansion::JA_COUNT
}
fn default_en_count() -> usize {
    expansion::EN_COUNT
}
fn default_expansion_timeout() -> u64 {
    timeouts::EXPANSION_SECS
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_expansion_endpoint(),
            ja_count: default_ja_count(),
            en_count: default_en_count(),
            timeout_secs: default_expansion_timeout(),
        }
    }
}

/// Which sparse search backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SparseBackend {
    /// Embedded Tantivy BM25 index kept in sync by the indexer
    #[default]
    Embedded,
    /// External keyword search service
    Http,
}

/// Sparse (keyword) search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseConfig {
    #[serde(default)]
    pub backend: SparseBackend,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    /// On-disk Tantivy index path; in-RAM when unset
    pub index_path: Option<String>,
    #[serde(default = "default_sparse_timeout")]
    pub timeout_secs: u64,
}

fn default_search_endpoint() -> String {
    endpoints::SEARCH_DEFAULT.clone()
}
fn default_sparse_timeout() -> u64 {
    timeouts::SPARSE_SECS
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            backend: SparseBackend::Embedded,
            endpoint: default_search_endpoint(),
            index_path: None,
            timeout_secs: default_sparse_timeout(),
        }
    }
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_dense_top_k")]
    pub dense_top_k: usize,
    #[serde(default = "default_sparse_top_k")]
    pub sparse_top_k: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_max_chunks")]
    pub default_max_chunks: usize,
    #[serde(default = "default_hard_max_chunks")]
    pub hard_max_chunks: usize,
}

fn default_dense_top_k() -> usize {
    retrieval::K_DENSE
}
fn default_sparse_top_k() -> usize {
    retrieval::K_SPARSE
}
fn default_rrf_k() -> f64 {
    retrieval::RRF_K
}
fn default_max_chunks() -> usize {
    retrieval::DEFAULT_MAX_CHUNKS
}
fn default_hard_max_chunks() -> usize {
    retrieval::HARD_MAX_CHUNKS
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_top_k: default_dense_top_k(),
            sparse_top_k: default_sparse_top_k(),
            rrf_k: default_rrf_k(),
            default_max_chunks: default_max_chunks(),
            hard_max_chunks: default_hard_max_chunks(),
        }
    }
}

/// Cross-encoder reranking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reranker_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_reranker_model")]
    pub model: String,
    #[serde(default = "default_reranker_timeout")]
    pub timeout_secs: u64,
    /// Candidates sent to the cross-encoder per request
    #[serde(default = "default_rerank_batch")]
    pub batch_size: usize,
}

fn default_reranker_endpoint() -> String {
    endpoints::RERANKER_DEFAULT.clone()
}
fn default_reranker_model() -> String {
    "bge-reranker-v2-m3".to_string()
}
fn default_reranker_timeout() -> u64 {
    timeouts::RERANKER_SECS
}
fn default_rerank_batch() -> usize {
    32
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_reranker_endpoint(),
            model: default_reranker_model(),
            timeout_secs: default_reranker_timeout(),
            batch_size: default_rerank_batch(),
        }
    }
}

/// Vector store (Qdrant) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_qdrant_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    pub api_key: Option<String>,
    /// Use the in-memory index instead of Qdrant (dev/tests)
    #[serde(default)]
    pub in_memory: bool,
}

fn default_qdrant_endpoint() -> String {
    endpoints::QDRANT_DEFAULT.clone()
}
fn default_collection() -> String {
    "article_chunks".to_string()
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_qdrant_endpoint(),
            collection: default_collection(),
            api_key: None,
            in_memory: false,
        }
    }
}

/// Indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Target chunk size T in tokens
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    /// Overlap O in tokens between consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap_tokens: usize,
    #[serde(default = "default_upsert_timeout")]
    pub upsert_timeout_secs: u64,
    /// Article authoring backend for backfill jobs
    #[serde(default = "default_articles_endpoint")]
    pub articles_endpoint: String,
}

fn default_chunk_tokens() -> usize {
    indexing::CHUNK_TOKENS
}
fn default_chunk_overlap() -> usize {
    indexing::CHUNK_OVERLAP_TOKENS
}
fn default_upsert_timeout() -> u64 {
    indexing::UPSERT_TIMEOUT_SECS
}
fn default_articles_endpoint() -> String {
    endpoints::ARTICLES_DEFAULT.clone()
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: default_chunk_tokens(),
            chunk_overlap_tokens: default_chunk_overlap(),
            upsert_timeout_secs: default_upsert_timeout(),
            articles_endpoint: default_articles_endpoint(),
        }
    }
}

/// Answer synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    #[serde(default = "default_chunk_char_budget")]
    pub chunk_char_budget: usize,
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,
    #[serde(default = "default_stream_deadline")]
    pub stream_deadline_secs: u64,
    #[serde(default = "default_sse_keepalive")]
    pub sse_keepalive_secs: u64,
    #[serde(default = "default_answer_max_tokens")]
    pub default_max_tokens: usize,
}

fn default_prompt_version() -> String {
    synthesis::PROMPT_VERSION.to_string()
}
fn default_chunk_char_budget() -> usize {
    synthesis::CHUNK_CHAR_BUDGET
}
fn default_context_char_budget() -> usize {
    synthesis::CONTEXT_CHAR_BUDGET
}
fn default_stream_deadline() -> u64 {
    synthesis::STREAM_DEADLINE_SECS
}
fn default_sse_keepalive() -> u64 {
    synthesis::SSE_KEEPALIVE_SECS
}
fn default_answer_max_tokens() -> usize {
    1024
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            prompt_version: default_prompt_version(),
            chunk_char_budget: default_chunk_char_budget(),
            context_char_budget: default_context_char_budget(),
            stream_deadline_secs: default_stream_deadline(),
            sse_keepalive_secs: default_sse_keepalive(),
            default_max_tokens: default_answer_max_tokens(),
        }
    }
}

/// LLM backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Request schema-constrained decoding when true
    #[serde(default = "default_true")]
    pub structured_output: bool,
}

fn default_llm_model() -> String {
    "qwen3:4b-instruct".to_string()
}
fn default_llm_endpoint() -> String {
    endpoints::OLLAMA_DEFAULT.clone()
}
fn default_llm_timeout() -> u64 {
    timeouts::LLM_SECS
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    0.9
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            endpoint: default_llm_endpoint(),
            api_key: None,
            timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            structured_output: true,
        }
    }
}

/// Persistence configuration (ScyllaDB)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Disabled means in-memory job store and version registry
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_scylla_hosts")]
    pub scylla_hosts: Vec<String>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
}

fn default_scylla_hosts() -> Vec<String> {
    std::env::var("SCYLLA_HOSTS")
        .map(|s| s.split(',').map(|h| h.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["127.0.0.1:9042".to_string()])
}

fn default_keyspace() -> String {
    std::env::var("SCYLLA_KEYSPACE").unwrap_or_else(|_| "quarry".to_string())
}

fn default_replication_factor() -> u8 {
    1
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scylla_hosts: default_scylla_hosts(),
            keyspace: default_keyspace(),
            replication_factor: default_replication_factor(),
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Idle poll interval before jitter (milliseconds)
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_max_attempts() -> u32 {
    jobs::MAX_ATTEMPTS
}
fn default_lease_secs() -> u64 {
    jobs::LEASE_SECS
}
fn default_workers() -> usize {
    jobs::WORKERS
}
fn default_idle_poll_ms() -> u64 {
    1000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            workers: default_workers(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate cross-field invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.vector_dim == 0 {
            return Err(ConfigError::Invalid(
                "embedding.vector_dim must be positive".to_string(),
            ));
        }
        if self.indexing.chunk_overlap_tokens >= self.indexing.chunk_tokens {
            return Err(ConfigError::Invalid(format!(
                "indexing.chunk_overlap_tokens ({}) must be smaller than chunk_tokens ({})",
                self.indexing.chunk_overlap_tokens, self.indexing.chunk_tokens
            )));
        }
        if self.retrieval.default_max_chunks > self.retrieval.hard_max_chunks {
            return Err(ConfigError::Invalid(
                "retrieval.default_max_chunks exceeds hard_max_chunks".to_string(),
            ));
        }
        if self.synthesis.chunk_char_budget == 0 || self.synthesis.context_char_budget == 0 {
            return Err(ConfigError::Invalid(
                "synthesis character budgets must be positive".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 || self.rerank.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch sizes must be positive".to_string(),
            ));
        }
        if self.jobs.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "jobs.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load settings with layered precedence:
/// env vars (`QUARRY_*`) > `config/{env}.yaml` > `config/default.yaml` > defaults
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    let default_path = Path::new("config/default.yaml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    if let Some(env_name) = env {
        let env_path_string = format!("config/{}.yaml", env_name);
        let env_path = Path::new(&env_path_string);
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        } else {
            tracing::warn!(path = %env_path_string, "Environment config file not found");
        }
    }

    builder = builder.add_source(Environment::with_prefix("QUARRY").separator("__"));

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retrieval.rrf_k, 60.0);
        assert_eq!(settings.retrieval.default_max_chunks, 5);
        assert_eq!(settings.indexing.chunk_tokens, 384);
        assert_eq!(settings.indexing.chunk_overlap_tokens, 64);
        assert_eq!(settings.embedding.batch_size, 16);
    }

    #[test]
    fn test_overlap_must_be_below_chunk_size() {
        let mut settings = Settings::default();
        settings.indexing.chunk_overlap_tokens = settings.indexing.chunk_tokens;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_max_chunks_cap() {
        let mut settings = Settings::default();
        settings.retrieval.default_max_chunks = settings.retrieval.hard_max_chunks + 1;
        assert!(settings.validate().is_err());
    }
}
