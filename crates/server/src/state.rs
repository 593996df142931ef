//! Application state
//!
//! Shared handles across all handlers and workers. Capabilities are injected
//! at construction; nothing here is a module-scope singleton.

use parking_lot::RwLock;
use std::sync::Arc;

use quarry_config::Settings;
use quarry_llm::LlmBackend;
use quarry_persistence::JobStore;
use quarry_rag::{ArticleProvider, Indexer};
use quarry_synthesis::AnswerPipeline;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration behind a lock for hot-reload support
    pub config: Arc<RwLock<Settings>>,
    /// Query-time pipeline (planner, retriever, reranker, LLM)
    pub pipeline: Arc<AnswerPipeline>,
    /// Index-time pipeline (chunker, embedder, vector store, versioning)
    pub indexer: Arc<Indexer>,
    /// Article authoring backend, used by backfill jobs
    pub articles: Arc<dyn ArticleProvider>,
    /// Durable job queue
    pub job_store: Arc<dyn JobStore>,
    /// LLM backend handle, used by the readiness probe
    pub llm: Arc<dyn LlmBackend>,
}

impl AppState {
    pub fn new(
        config: Settings,
        pipeline: Arc<AnswerPipeline>,
        indexer: Arc<Indexer>,
        articles: Arc<dyn ArticleProvider>,
        job_store: Arc<dyn JobStore>,
        llm: Arc<dyn LlmBackend>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            pipeline,
            indexer,
            articles,
            job_store,
            llm,
        }
    }

    pub fn get_config(&self) -> Settings {
        self.config.read().clone()
    }
}
