//! Indexing pipeline
//!
//! Upsert is chunk -> embed -> write -> commit. Embedding happens entirely
//! before any write, so a failed batch leaves the prior version untouched.
//! The commit point is the version registry compare-and-set: a reader either
//! resolves the article to its old version or to the new one, never a mix.
//! Tombstoning of prior-version points happens after commit and is best
//! effort; physical reclamation is out-of-band.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use quarry_core::{Article, DocumentVersion, NO_VERSION};
use quarry_persistence::VersionRegistry;

use crate::chunker::Chunker;
use crate::embeddings::Embedder;
use crate::sparse::TantivySparseIndex;
use crate::vector_store::{ChunkRecord, VectorIndex};
use crate::RagError;

/// Indexer configuration
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    /// Chunks embedded per request
    pub batch_size: usize,
    /// Per-batch embedding timeout
    pub batch_timeout: Duration,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            batch_size: 16,
            batch_timeout: Duration::from_secs(30),
        }
    }
}

impl IndexerSettings {
    pub fn from_settings(cfg: &quarry_config::EmbeddingConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            batch_timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

/// Indexer owning the write path of the chunk corpus
pub struct Indexer {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    vector_index: Arc<dyn VectorIndex>,
    /// Embedded sparse index kept in sync post-commit, when configured
    sparse_index: Option<TantivySparseIndex>,
    registry: Arc<dyn VersionRegistry>,
    settings: IndexerSettings,
}

impl Indexer {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        vector_index: Arc<dyn VectorIndex>,
        registry: Arc<dyn VersionRegistry>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            chunker,
            embedder,
            vector_index,
            sparse_index: None,
            registry,
            settings,
        }
    }

    pub fn with_sparse_index(mut self, sparse: TantivySparseIndex) -> Self {
        self.sparse_index = Some(sparse);
        self
    }

    /// Idempotent upsert with the configured embedder
    pub async fn upsert(&self, article: &Article) -> Result<DocumentVersion, RagError> {
        self.upsert_with_embedder(article, self.embedder.as_ref())
            .await
    }

    /// Upsert with an explicit embedder. The per-request override on the
    /// upsert route lands here; chunking, versioning and the transaction are
    /// identical.
    pub async fn upsert_with_embedder(
        &self,
        article: &Article,
        embedder: &dyn Embedder,
    ) -> Result<DocumentVersion, RagError> {
        let pieces = self.chunker.chunk(&article.body);
        let current = self.registry.current(&article.article_id).await?;
        let new_version = current.max(NO_VERSION) + 1;

        // Embed every batch before writing anything
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let vectors =
                tokio::time::timeout(self.settings.batch_timeout, embedder.encode(&texts))
                    .await
                    .map_err(|_| RagError::Connection {
                        dependency: "embedder",
                        message: "embedding batch timed out".to_string(),
                    })??;

            if vectors.len() != texts.len() {
                return Err(RagError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                )));
            }
            for vector in &vectors {
                if vector.len() != embedder.dim() {
                    return Err(RagError::DimensionMismatch {
                        expected: embedder.dim(),
                        actual: vector.len(),
                    });
                }
            }
            embeddings.extend(vectors);
        }

        let records: Vec<ChunkRecord> = pieces
            .iter()
            .zip(embeddings)
            .map(|(piece, embedding)| ChunkRecord {
                chunk_id: Uuid::new_v4().to_string(),
                article_id: article.article_id.clone(),
                ordinal: piece.ordinal,
                text: piece.text.clone(),
                title: article.title.clone(),
                url: article.url.clone(),
                published_at: article.published_at,
                document_version: new_version,
                embedding,
            })
            .collect();

        self.vector_index.upsert_chunks(&records).await?;

        // Commit: flip the article's current version. Losing the CAS means a
        // concurrent upsert won; the freshly written points are unreferenced
        // garbage for out-of-band reclamation.
        let committed = self
            .registry
            .set_current(&article.article_id, current, new_version)
            .await?;
        if !committed {
            return Err(RagError::Conflict(format!(
                "concurrent upsert of article {}",
                article.article_id
            )));
        }

        if let Some(ref sparse) = self.sparse_index {
            let sparse = sparse.clone();
            let article_id = article.article_id.clone();
            let tags = article.tags.clone();
            let sparse_records = records.clone();
            let result = tokio::task::spawn_blocking(move || {
                sparse.replace_article(&article_id, &sparse_records, &tags)
            })
            .await
            .map_err(|e| RagError::Index(format!("sparse index task failed: {}", e)))?;
            if let Err(e) = result {
                tracing::warn!(article_id = %article.article_id, error = %e,
                    "Sparse index update failed after commit");
            }
        }

        if let Err(e) = self
            .vector_index
            .tombstone(&article.article_id, new_version)
            .await
        {
            tracing::warn!(article_id = %article.article_id, error = %e,
                "Tombstoning prior versions failed; reclamation will retry out-of-band");
        }

        tracing::info!(
            article_id = %article.article_id,
            version = new_version,
            chunks = records.len(),
            "Article indexed"
        );

        Ok(new_version)
    }

    /// Tombstone every chunk of an article
    pub async fn delete(&self, article_id: &str) -> Result<(), RagError> {
        let current = self.registry.current(article_id).await?;

        if current != NO_VERSION {
            let committed = self
                .registry
                .set_current(article_id, current, NO_VERSION)
                .await?;
            if !committed {
                return Err(RagError::Conflict(format!(
                    "concurrent write to article {}",
                    article_id
                )));
            }
        }

        if let Some(ref sparse) = self.sparse_index {
            let sparse = sparse.clone();
            let id = article_id.to_string();
            let result = tokio::task::spawn_blocking(move || sparse.delete_article(&id))
                .await
                .map_err(|e| RagError::Index(format!("sparse index task failed: {}", e)))?;
            if let Err(e) = result {
                tracing::warn!(article_id, error = %e, "Sparse delete failed");
            }
        }

        if let Err(e) = self.vector_index.tombstone(article_id, i64::MAX).await {
            tracing::warn!(article_id, error = %e, "Tombstoning failed; will retry out-of-band");
        }

        tracing::info!(article_id, "Article tombstoned");
        Ok(())
    }

    /// Re-embed an article body that is already known; used by re-embed jobs
    /// after an embedder model change
    pub async fn reembed(&self, article: &Article) -> Result<DocumentVersion, RagError> {
        self.upsert(article).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::vector_store::MemoryIndex;
    use async_trait::async_trait;
    use quarry_persistence::MemoryVersionRegistry;

    /// Deterministic embedder: a tiny bag-of-bytes projection
    struct TestEmbedder {
        dim: usize,
    }

    #[async_trait]
    impl Embedder for TestEmbedder {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; self.dim];
                    for (i, b) in text.bytes().enumerate() {
                        v[i % self.dim] += b as f32 / 255.0;
                    }
                    v
                })
                .collect())
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn model(&self) -> &str {
            "test-embedder"
        }
    }

    /// Fails on the second batch, to exercise atomicity
    struct FlakyEmbedder {
        dim: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call >= 1 {
                return Err(RagError::Connection {
                    dependency: "embedder",
                    message: "reset".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![0.1; self.dim]).collect())
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn model(&self) -> &str {
            "flaky"
        }
    }

    fn article(body: &str) -> Article {
        Article::new("a1", "Title", "http://example.com/a1", body)
    }

    fn long_body() -> String {
        "The quick brown fox jumps over the lazy dog near the river bank. "
            .repeat(120)
    }

    fn indexer(
        embedder: Arc<dyn Embedder>,
        index: Arc<MemoryIndex>,
        registry: Arc<MemoryVersionRegistry>,
    ) -> Indexer {
        Indexer::new(
            Chunker::new(ChunkerConfig {
                target_tokens: 40,
                overlap_tokens: 8,
            }),
            embedder,
            index,
            registry,
            IndexerSettings {
                batch_size: 4,
                batch_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_advances_version_and_hides_old_chunks() {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(MemoryVersionRegistry::new());
        let indexer = indexer(Arc::new(TestEmbedder { dim: 8 }), index.clone(), registry.clone());

        let v1 = indexer.upsert(&article(&long_body())).await.unwrap();
        assert_eq!(v1, 1);
        let v2 = indexer.upsert(&article(&long_body())).await.unwrap();
        assert_eq!(v2, 2);

        assert_eq!(registry.current("a1").await.unwrap(), 2);

        // Only version-2 chunks remain visible
        let hits = index.search(&vec![0.5; 8], 100, None).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.document_version == 2));
    }

    #[tokio::test]
    async fn test_identical_upserts_produce_identical_chunk_texts() {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(MemoryVersionRegistry::new());
        let chunker = Chunker::new(ChunkerConfig {
            target_tokens: 40,
            overlap_tokens: 8,
        });
        let body = long_body();
        let first = chunker.chunk(&body);
        let second = chunker.chunk(&body);
        assert_eq!(first, second);

        let indexer = indexer(Arc::new(TestEmbedder { dim: 8 }), index, registry.clone());
        indexer.upsert(&article(&body)).await.unwrap();
        indexer.upsert(&article(&body)).await.unwrap();
        assert_eq!(registry.current("a1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_prior_version_current() {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(MemoryVersionRegistry::new());

        let good = indexer(Arc::new(TestEmbedder { dim: 8 }), index.clone(), registry.clone());
        good.upsert(&article(&long_body())).await.unwrap();
        let visible_before = index.live_len();

        // Second batch of the next upsert fails; nothing may change
        let flaky = indexer(
            Arc::new(FlakyEmbedder {
                dim: 8,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
            index.clone(),
            registry.clone(),
        );
        let err = flaky.upsert(&article(&long_body())).await.unwrap_err();
        assert!(matches!(err, RagError::Connection { .. }));

        assert_eq!(registry.current("a1").await.unwrap(), 1);
        assert_eq!(index.live_len(), visible_before);
    }

    /// Registry that always reads version 0, so the CAS sees the competing
    /// writer's commit and loses
    struct StaleReadRegistry {
        inner: MemoryVersionRegistry,
    }

    #[async_trait]
    impl VersionRegistry for StaleReadRegistry {
        async fn current(
            &self,
            _: &str,
        ) -> Result<DocumentVersion, quarry_persistence::PersistenceError> {
            Ok(NO_VERSION)
        }

        async fn current_many(
            &self,
            ids: &[String],
        ) -> Result<
            std::collections::HashMap<String, DocumentVersion>,
            quarry_persistence::PersistenceError,
        > {
            self.inner.current_many(ids).await
        }

        async fn set_current(
            &self,
            article_id: &str,
            expected: DocumentVersion,
            new: DocumentVersion,
        ) -> Result<bool, quarry_persistence::PersistenceError> {
            self.inner.set_current(article_id, expected, new).await
        }
    }

    #[tokio::test]
    async fn test_lost_cas_surfaces_conflict() {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(StaleReadRegistry {
            inner: MemoryVersionRegistry::new(),
        });
        // Competing writer already committed version 1
        registry.inner.set_current("a1", 0, 1).await.unwrap();

        let indexer = Indexer::new(
            Chunker::default(),
            Arc::new(TestEmbedder { dim: 8 }),
            index,
            registry,
            IndexerSettings::default(),
        );

        let err = indexer.upsert(&article("short body.")).await.unwrap_err();
        assert!(matches!(err, RagError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_hides_all_chunks() {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(MemoryVersionRegistry::new());
        let indexer = indexer(Arc::new(TestEmbedder { dim: 8 }), index.clone(), registry.clone());

        indexer.upsert(&article(&long_body())).await.unwrap();
        indexer.delete("a1").await.unwrap();

        assert_eq!(registry.current("a1").await.unwrap(), NO_VERSION);
        assert_eq!(index.live_len(), 0);
    }

    #[tokio::test]
    async fn test_sparse_index_follows_upserts() {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(MemoryVersionRegistry::new());
        let sparse = TantivySparseIndex::new(Default::default()).unwrap();
        let indexer = indexer(Arc::new(TestEmbedder { dim: 8 }), index, registry)
            .with_sparse_index(sparse.clone());

        indexer
            .upsert(&article("A quarterly report about TPU accelerators."))
            .await
            .unwrap();

        use crate::sparse::SparseSearcher;
        let hits = sparse.search("TPU", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        indexer.delete("a1").await.unwrap();
        let hits = sparse.search("TPU", None, 10).await.unwrap();
        assert!(hits.is_empty());
    }
}
