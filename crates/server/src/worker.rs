//! Background job workers
//!
//! Each worker loops: claim a job under a lease, dispatch it to the indexer,
//! complete or fail it. Conflicts from concurrent upserts fail the job back
//! into the queue, where it retries until the attempt budget runs out. Idle
//! workers poll with jitter so a fleet does not thundering-herd the store.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use quarry_config::JobsConfig;
use quarry_core::{JobType, RagJob};
use quarry_persistence::JobStore;
use quarry_rag::{ArticleProvider, Indexer, RagError};

use crate::metrics;

const CLAIMED_TYPES: &[JobType] = &[
    JobType::BackfillArticle,
    JobType::ReembedArticle,
    JobType::DeleteArticle,
];

/// Spawn the configured number of worker loops. Workers stop when the
/// shutdown signal flips to true.
pub fn spawn_workers(
    job_store: Arc<dyn JobStore>,
    indexer: Arc<Indexer>,
    articles: Arc<dyn ArticleProvider>,
    config: JobsConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..config.workers.max(1))
        .map(|i| {
            let worker_id = format!("worker-{}", i);
            let job_store = Arc::clone(&job_store);
            let indexer = Arc::clone(&indexer);
            let articles = Arc::clone(&articles);
            let config = config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, job_store, indexer, articles, config, shutdown).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: String,
    job_store: Arc<dyn JobStore>,
    indexer: Arc<Indexer>,
    articles: Arc<dyn ArticleProvider>,
    config: JobsConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker_id, "Worker started");
    let lease = Duration::from_secs(config.lease_secs);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match job_store.claim(&worker_id, CLAIMED_TYPES, lease).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                let job_type = job.job_type;
                match run_job(&job, indexer.as_ref(), articles.as_ref()).await {
                    Ok(()) => {
                        if let Err(e) = job_store.complete(job_id).await {
                            tracing::error!(worker_id, job_id = %job_id, error = %e,
                                "Failed to mark job complete");
                        }
                        metrics::record_job(job_type.as_str(), "done");
                    }
                    Err(e) => {
                        tracing::warn!(worker_id, job_id = %job_id, error = %e, "Job failed");
                        if let Err(store_err) =
                            job_store.fail(job_id, &e.to_string()).await
                        {
                            tracing::error!(worker_id, job_id = %job_id, error = %store_err,
                                "Failed to record job failure");
                        }
                        metrics::record_job(job_type.as_str(), "failed");
                    }
                }
            }
            Ok(None) => {
                // Idle: poll again after the configured interval plus jitter
                let jitter = rand::thread_rng().gen_range(0..=config.idle_poll_ms / 2);
                let sleep = Duration::from_millis(config.idle_poll_ms + jitter);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    tracing::info!(worker_id, "Worker stopped");
}

/// Execute one job against the indexer
async fn run_job(
    job: &RagJob,
    indexer: &Indexer,
    articles: &dyn ArticleProvider,
) -> Result<(), RagError> {
    let article_id = job
        .article_id()
        .ok_or_else(|| RagError::InvalidArgument("job payload missing article_id".to_string()))?;

    match job.job_type {
        JobType::BackfillArticle | JobType::ReembedArticle => {
            let article = articles.fetch(article_id).await?.ok_or_else(|| {
                RagError::InvalidArgument(format!("article {} not found", article_id))
            })?;
            let version = indexer.upsert(&article).await?;
            tracing::info!(job_id = %job.id, article_id, version, "Job indexed article");
            Ok(())
        }
        JobType::DeleteArticle => {
            indexer.delete(article_id).await?;
            tracing::info!(job_id = %job.id, article_id, "Job tombstoned article");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quarry_core::{Article, JobStatus};
    use quarry_persistence::{MemoryJobStore, MemoryVersionRegistry, VersionRegistry};
    use quarry_rag::{Chunker, Embedder, IndexerSettings, MemoryArticleProvider, MemoryIndex};

    struct TestEmbedder;

    #[async_trait]
    impl Embedder for TestEmbedder {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            Ok(texts.iter().map(|_| vec![0.3; 4]).collect())
        }

        fn dim(&self) -> usize {
            4
        }

        fn model(&self) -> &str {
            "test"
        }
    }

    struct Harness {
        job_store: Arc<MemoryJobStore>,
        indexer: Arc<Indexer>,
        articles: Arc<MemoryArticleProvider>,
        registry: Arc<MemoryVersionRegistry>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(MemoryVersionRegistry::new());
        let indexer = Arc::new(Indexer::new(
            Chunker::default(),
            Arc::new(TestEmbedder),
            Arc::new(MemoryIndex::new()),
            registry.clone(),
            IndexerSettings::default(),
        ));
        Harness {
            job_store: Arc::new(MemoryJobStore::new(2)),
            indexer,
            articles: Arc::new(MemoryArticleProvider::new()),
            registry,
        }
    }

    fn backfill_job(article_id: &str) -> RagJob {
        RagJob::new(
            JobType::BackfillArticle,
            serde_json::json!({ "article_id": article_id }),
        )
    }

    #[tokio::test]
    async fn test_backfill_job_indexes_article() {
        let h = harness();
        h.articles
            .insert(Article::new("a1", "Title", "http://x", "Some article body."));
        let job = backfill_job("a1");

        run_job(&job, &h.indexer, h.articles.as_ref())
            .await
            .unwrap();
        assert_eq!(h.registry.current("a1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_article_fails_the_job() {
        let h = harness();
        let job = backfill_job("missing");
        assert!(run_job(&job, &h.indexer, h.articles.as_ref())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_worker_loop_drains_queue_and_stops() {
        let h = harness();
        h.articles
            .insert(Article::new("a1", "Title", "http://x", "Body one."));
        h.articles
            .insert(Article::new("a2", "Title", "http://x", "Body two."));
        let job1 = backfill_job("a1");
        let job2 = backfill_job("a2");
        h.job_store.enqueue(&job1).await.unwrap();
        h.job_store.enqueue(&job2).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_workers(
            h.job_store.clone(),
            h.indexer.clone(),
            h.articles.clone(),
            JobsConfig {
                workers: 2,
                idle_poll_ms: 10,
                ..Default::default()
            },
            shutdown_rx,
        );

        // Give the workers a moment to drain the queue
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(h.job_store.get(job1.id).unwrap().status, JobStatus::Done);
        assert_eq!(h.job_store.get(job2.id).unwrap().status, JobStatus::Done);
        assert_eq!(h.registry.current("a1").await.unwrap(), 1);
        assert_eq!(h.registry.current("a2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failing_job_goes_dead_after_budget() {
        let h = harness();
        // No article inserted: the job always fails; budget is 2 attempts
        let job = backfill_job("missing");
        h.job_store.enqueue(&job).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_workers(
            h.job_store.clone(),
            h.indexer.clone(),
            h.articles.clone(),
            JobsConfig {
                workers: 1,
                idle_poll_ms: 10,
                ..Default::default()
            },
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let dead = h.job_store.get(job.id).unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempts, 2);
    }
}
