//! Configuration for the Quarry RAG orchestrator
//!
//! Settings are layered: `config/default.yaml`, then `config/{env}.yaml`,
//! then `QUARRY_*` environment variables. Every field has a serde default so
//! a missing file degrades to the built-in defaults.

pub mod constants;
mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{
    load_settings, EmbeddingConfig, ExpansionConfig, IndexingConfig, JobsConfig, LlmConfig,
    ObservabilityConfig, PersistenceConfig, RerankConfig, RetrievalConfig, RuntimeEnvironment,
    ServerConfig, Settings, SparseBackend, SparseConfig, SynthesisConfig, VectorStoreConfig,
};
