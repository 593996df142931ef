//! Quarry server entry point

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use quarry_config::{load_settings, Settings, SparseBackend};
use quarry_llm::{LlmBackend, OllamaBackend, RuntimeLlmConfig};
use quarry_persistence::{
    JobStore, MemoryJobStore, MemoryVersionRegistry, ScyllaConfig, VersionRegistry,
};
use quarry_rag::{
    ArticleProvider, Chunker, ChunkerConfig, Embedder, HttpArticleProvider, HttpEmbedder,
    HttpEmbedderConfig, HttpExpansion, HttpExpansionConfig, HttpReranker, HttpRerankerConfig,
    HttpSparseSearch, HttpSparseSearchConfig, HybridRetriever, Indexer, IndexerSettings,
    MemoryIndex, NoExpansion, PlannerSettings, QdrantIndex, QdrantIndexConfig, QueryExpander,
    QueryPlanner, Reranker, RetrieverSettings, SparseSearcher, TantivySparseIndex,
    TantivySparseIndexConfig, VectorIndex,
};
use quarry_server::{create_router, init_metrics, spawn_workers, AppState};
use quarry_synthesis::{AnswerPipeline, SynthesisSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Priority: env vars > config/{env}.yaml > config/default.yaml > defaults
    let env = std::env::var("QUARRY_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("Warning: failed to load config: {}. Using defaults.", e);
            Settings::default()
        }
    };

    init_tracing(&config);
    tracing::info!("Starting Quarry server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(environment = ?config.environment, "Configuration loaded");

    if init_metrics().is_some() {
        tracing::info!("Initialized Prometheus metrics at /metrics");
    }

    // Capability adapters
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
        HttpEmbedderConfig::from_settings(&config.embedding),
    )?);

    let expander: Arc<dyn QueryExpander> = if config.expansion.enabled {
        Arc::new(HttpExpansion::new(HttpExpansionConfig::from_settings(
            &config.expansion,
        ))?)
    } else {
        tracing::info!("Query expansion disabled");
        Arc::new(NoExpansion)
    };

    let vector_index: Arc<dyn VectorIndex> = if config.vector_store.in_memory {
        tracing::info!("Using in-memory vector index");
        Arc::new(MemoryIndex::new())
    } else {
        let index = QdrantIndex::new(QdrantIndexConfig::from_settings(
            &config.vector_store,
            config.embedding.vector_dim,
        ))?;
        index.ensure_ready().await?;
        tracing::info!(
            endpoint = %config.vector_store.endpoint,
            collection = %config.vector_store.collection,
            "Vector index ready"
        );
        Arc::new(index)
    };

    // Embedded Tantivy keeps sparse search in-process and in sync with the
    // indexer; the HTTP backend delegates to an external search service
    let (sparse_searcher, embedded_sparse): (Arc<dyn SparseSearcher>, Option<TantivySparseIndex>) =
        match config.sparse.backend {
            SparseBackend::Embedded => {
                let index = TantivySparseIndex::new(TantivySparseIndexConfig {
                    index_path: config.sparse.index_path.clone(),
                })?;
                tracing::info!(
                    path = config.sparse.index_path.as_deref().unwrap_or("<ram>"),
                    "Embedded sparse index ready"
                );
                (Arc::new(index.clone()), Some(index))
            }
            SparseBackend::Http => {
                tracing::info!(endpoint = %config.sparse.endpoint, "Using external sparse search");
                (
                    Arc::new(HttpSparseSearch::new(HttpSparseSearchConfig::from_settings(
                        &config.sparse,
                    ))?),
                    None,
                )
            }
        };

    // Shared mutable state: job store and version registry
    let (job_store, registry): (Arc<dyn JobStore>, Arc<dyn VersionRegistry>) =
        if config.persistence.enabled {
            tracing::info!(
                hosts = ?config.persistence.scylla_hosts,
                keyspace = %config.persistence.keyspace,
                "Initializing ScyllaDB persistence"
            );
            let layer = quarry_persistence::init(
                ScyllaConfig {
                    hosts: config.persistence.scylla_hosts.clone(),
                    keyspace: config.persistence.keyspace.clone(),
                    replication_factor: config.persistence.replication_factor,
                },
                config.jobs.max_attempts,
            )
            .await?;
            (Arc::new(layer.jobs), Arc::new(layer.versions))
        } else {
            tracing::info!("Persistence disabled, using in-memory job store and registry");
            (
                Arc::new(MemoryJobStore::new(config.jobs.max_attempts)),
                Arc::new(MemoryVersionRegistry::new()),
            )
        };

    let reranker: Option<Arc<dyn Reranker>> = if config.rerank.enabled {
        Some(Arc::new(HttpReranker::new(
            HttpRerankerConfig::from_settings(&config.rerank),
        )?))
    } else {
        tracing::info!("Reranking disabled");
        None
    };

    let llm: Arc<dyn LlmBackend> = Arc::new(OllamaBackend::new(RuntimeLlmConfig::from_settings(
        &config.llm,
    ))?);

    let articles: Arc<dyn ArticleProvider> = Arc::new(HttpArticleProvider::from_endpoint(
        &config.indexing.articles_endpoint,
    )?);

    // Pipelines
    let planner = Arc::new(QueryPlanner::new(
        Arc::clone(&embedder),
        expander,
        PlannerSettings::from_settings(&config.expansion),
    ));
    let retriever = Arc::new(HybridRetriever::new(
        Arc::clone(&vector_index),
        sparse_searcher,
        Arc::clone(&registry),
        RetrieverSettings::from_settings(&config.retrieval),
    ));
    let pipeline = Arc::new(AnswerPipeline::new(
        planner,
        retriever,
        reranker,
        Arc::clone(&llm),
        SynthesisSettings::from_settings(&config),
    ));

    let mut indexer = Indexer::new(
        Chunker::new(ChunkerConfig::from_settings(&config.indexing)),
        Arc::clone(&embedder),
        vector_index,
        registry,
        IndexerSettings::from_settings(&config.embedding),
    );
    if let Some(sparse) = embedded_sparse {
        indexer = indexer.with_sparse_index(sparse);
    }
    let indexer = Arc::new(indexer);

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = spawn_workers(
        Arc::clone(&job_store),
        Arc::clone(&indexer),
        Arc::clone(&articles),
        config.jobs.clone(),
        shutdown_rx,
    );
    tracing::info!(workers = config.jobs.workers, "Background workers started");

    let port = config.server.port;
    let state = AppState::new(config, pipeline, indexer, articles, job_store, llm);
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop workers after the HTTP server drains
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Initialize tracing with env-filter and optional JSON output
fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("quarry={},tower_http=info", level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
