//! Centralized constants
//!
//! Single source of truth for endpoint defaults and pipeline tuning values
//! used across the codebase. Anything deployment-specific is overridable via
//! `Settings`; these are the fallbacks.

/// Service endpoints (loaded from env vars with fallback defaults)
pub mod endpoints {
    use once_cell::sync::Lazy;

    /// Ollama-compatible LLM endpoint (env: OLLAMA_URL)
    pub static OLLAMA_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
    });

    /// Qdrant vector store endpoint (env: QDRANT_URL)
    pub static QDRANT_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6333".to_string())
    });

    /// Cross-encoder reranker service (env: RERANKER_URL)
    pub static RERANKER_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("RERANKER_URL").unwrap_or_else(|_| "http://localhost:9000".to_string())
    });

    /// Query expansion service (env: EXPANSION_URL)
    pub static EXPANSION_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("EXPANSION_URL").unwrap_or_else(|_| "http://localhost:9100".to_string())
    });

    /// External keyword search service (env: SEARCH_URL)
    pub static SEARCH_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("SEARCH_URL").unwrap_or_else(|_| "http://localhost:7700".to_string())
    });

    /// Article authoring backend (env: ARTICLES_URL)
    pub static ARTICLES_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("ARTICLES_URL").unwrap_or_else(|_| "http://localhost:8200".to_string())
    });
}

/// Retrieval tuning
pub mod retrieval {
    /// RRF constant k
    pub const RRF_K: f64 = 60.0;

    /// Dense channel candidate bound
    pub const K_DENSE: usize = 50;

    /// Sparse channel candidate bound (per query variant)
    pub const K_SPARSE: usize = 50;

    /// Default final context cap
    pub const DEFAULT_MAX_CHUNKS: usize = 5;

    /// Hard final context cap
    pub const HARD_MAX_CHUNKS: usize = 20;

    /// Fusion cutoff: `max(max_chunks * FUSE_MULTIPLIER, FUSE_FLOOR)`
    pub const FUSE_MULTIPLIER: usize = 4;
    pub const FUSE_FLOOR: usize = 32;
}

/// Answer synthesis
pub mod synthesis {
    /// Per-chunk character budget in the prompt
    pub const CHUNK_CHAR_BUDGET: usize = 1200;

    /// Aggregate context character budget
    pub const CONTEXT_CHAR_BUDGET: usize = 12_000;

    /// Prompt template version, surfaced in debug metadata
    pub const PROMPT_VERSION: &str = "rag-answer-v2";

    /// End-to-end streaming deadline (seconds)
    pub const STREAM_DEADLINE_SECS: u64 = 90;

    /// SSE keep-alive comment interval (seconds)
    pub const SSE_KEEPALIVE_SECS: u64 = 10;
}

/// Indexing
pub mod indexing {
    /// Target chunk size in tokens
    pub const CHUNK_TOKENS: usize = 384;

    /// Overlap between consecutive chunks in tokens
    pub const CHUNK_OVERLAP_TOKENS: usize = 64;

    /// Embedding batch size
    pub const EMBED_BATCH: usize = 16;

    /// Upsert transaction timeout (seconds)
    pub const UPSERT_TIMEOUT_SECS: u64 = 90;
}

/// Query expansion defaults
pub mod expansion {
    /// Japanese variants requested
    pub const JA_COUNT: usize = 2;

    /// English variants requested
    pub const EN_COUNT: usize = 2;
}

/// Background jobs
pub mod jobs {
    /// Attempts before a job goes dead
    pub const MAX_ATTEMPTS: u32 = 5;

    /// Claim lease duration (seconds)
    pub const LEASE_SECS: u64 = 60;

    /// Worker loops per process
    pub const WORKERS: usize = 2;
}

/// Per-call timeouts (seconds)
pub mod timeouts {
    pub const EMBEDDER_SECS: u64 = 30;
    pub const EXPANSION_SECS: u64 = 5;
    pub const SPARSE_SECS: u64 = 10;
    pub const RERANKER_SECS: u64 = 30;
    pub const LLM_SECS: u64 = 90;
}
