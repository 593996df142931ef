//! Retrieval and indexing for the Quarry RAG orchestrator
//!
//! Features:
//! - Query planning: normalization, multilingual expansion, dense embedding
//! - Hybrid retrieval: dense ANN + sparse BM25 fused with reciprocal rank
//!   fusion (k = 60)
//! - Cross-encoder reranking with order-preserving degradation
//! - Deterministic overlapping chunking
//! - Versioned transactional indexing with tombstoning
//!
//! Downstream services (embedder, expansion, sparse search, reranker, vector
//! store, article backend) are capability traits; HTTP adapters live beside
//! in-memory/embedded implementations used by tests and single-node
//! deployments.

pub mod articles;
pub mod chunker;
pub mod embeddings;
pub mod expansion;
pub mod indexer;
pub mod planner;
pub mod reranker;
pub mod retriever;
pub mod sparse;
pub mod vector_store;

pub use articles::{
    ArticleProvider, HttpArticleProvider, HttpArticleProviderConfig, MemoryArticleProvider,
};
pub use chunker::{Chunker, ChunkerConfig};
pub use embeddings::{Embedder, HttpEmbedder, HttpEmbedderConfig};
pub use expansion::{HttpExpansion, HttpExpansionConfig, NoExpansion, QueryExpander};
pub use indexer::{Indexer, IndexerSettings};
pub use planner::{PlannedQuery, PlannerSettings, QueryPlanner};
pub use reranker::{apply_rerank, HttpReranker, HttpRerankerConfig, RerankScore, Reranker};
pub use retriever::{rrf_fuse, HybridRetriever, RetrievalOutcome, RetrieverSettings};
pub use sparse::{
    HttpSparseSearch, HttpSparseSearchConfig, SparseHit, SparseSearcher, TantivySparseIndex,
    TantivySparseIndexConfig,
};
pub use vector_store::{
    ChunkRecord, DenseHit, MemoryIndex, QdrantIndex, QdrantIndexConfig, VectorIndex,
};

use thiserror::Error;

/// Retrieval and indexing errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("query expansion error: {0}")]
    Expansion(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("sparse search error: {0}")]
    Search(String),

    #[error("reranker error: {0}")]
    Reranker(String),

    #[error("index error: {0}")]
    Index(String),

    /// Transport-level failure; retried once at the orchestration layer
    #[error("{dependency} unreachable: {message}")]
    Connection {
        dependency: &'static str,
        message: String,
    },

    /// Both retrieval channels failed, or one failed with too few results
    /// from the other
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] quarry_persistence::PersistenceError),
}

impl RagError {
    /// Classify a reqwest transport failure for a named dependency
    pub fn transport(dependency: &'static str, err: reqwest::Error) -> Self {
        RagError::Connection {
            dependency,
            message: err.to_string(),
        }
    }
}

impl From<RagError> for quarry_core::Error {
    fn from(err: RagError) -> Self {
        use quarry_core::Error;
        match err {
            RagError::Connection {
                dependency,
                message,
            } => Error::DependencyUnavailable {
                dependency,
                message,
                transient: true,
            },
            RagError::Embedding(m) => Error::permanent("embedder", m),
            RagError::Expansion(m) => Error::permanent("expansion", m),
            RagError::Search(m) => Error::permanent("sparse_search", m),
            RagError::Reranker(m) => Error::permanent("reranker", m),
            RagError::Retrieval(m) => Error::RetrievalFailed(m),
            RagError::Conflict(m) => Error::Conflict(m),
            RagError::InvalidArgument(m) => Error::InvalidArgument(m),
            RagError::DimensionMismatch { expected, actual } => Error::Internal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                expected, actual
            )),
            other => Error::Internal(other.to_string()),
        }
    }
}
