//! Hybrid retriever
//!
//! Dense and sparse channels run concurrently; rankings are combined with
//! reciprocal rank fusion. Dense hits are filtered against the version
//! registry so only current document versions surface; sparse queries fan out
//! over the expanded variants and merge by best per-query rank.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

use quarry_core::{Channel, FusedResult, RetrievalCandidate, NO_VERSION};
use quarry_persistence::VersionRegistry;

use crate::planner::PlannedQuery;
use crate::sparse::SparseSearcher;
use crate::vector_store::VectorIndex;
use crate::RagError;

/// Retriever configuration
#[derive(Debug, Clone)]
pub struct RetrieverSettings {
    /// Dense channel candidate bound K_dense
    pub dense_top_k: usize,
    /// Sparse candidate bound K_sparse, per query variant
    pub sparse_top_k: usize,
    /// RRF constant k
    pub rrf_k: f64,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self {
            dense_top_k: 50,
            sparse_top_k: 50,
            rrf_k: 60.0,
        }
    }
}

impl RetrieverSettings {
    pub fn from_settings(cfg: &quarry_config::RetrievalConfig) -> Self {
        Self {
            dense_top_k: cfg.dense_top_k,
            sparse_top_k: cfg.sparse_top_k,
            rrf_k: cfg.rrf_k,
        }
    }
}

/// Retrieval result with per-channel health, for debug metadata
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Fused results, best first, cut to `max(max_chunks * 4, 32)`
    pub fused: Vec<FusedResult>,
    pub dense_failed: bool,
    pub sparse_failed: bool,
}

/// Hybrid retriever over the vector index and a sparse searcher
pub struct HybridRetriever {
    vector_index: Arc<dyn VectorIndex>,
    sparse: Arc<dyn SparseSearcher>,
    registry: Arc<dyn VersionRegistry>,
    settings: RetrieverSettings,
}

impl HybridRetriever {
    pub fn new(
        vector_index: Arc<dyn VectorIndex>,
        sparse: Arc<dyn SparseSearcher>,
        registry: Arc<dyn VersionRegistry>,
        settings: RetrieverSettings,
    ) -> Self {
        Self {
            vector_index,
            sparse,
            registry,
            settings,
        }
    }

    /// Run both channels and fuse. A single failed channel degrades to
    /// partial results when the surviving channel produced at least
    /// `max_chunks` candidates; anything less fails the request.
    pub async fn retrieve(
        &self,
        planned: &PlannedQuery,
        max_chunks: usize,
        article_filter: Option<&[String]>,
        user_id: Option<&str>,
    ) -> Result<RetrievalOutcome, RagError> {
        let (dense_result, sparse_result) = tokio::join!(
            self.dense_channel(planned),
            self.sparse_channel(planned, user_id)
        );

        let (dense, dense_failed) = match dense_result {
            Ok(candidates) => (candidates, false),
            Err(e) => {
                tracing::warn!(error = %e, "Dense channel failed");
                (Vec::new(), true)
            }
        };
        let (sparse, sparse_failed) = match sparse_result {
            Ok(candidates) => (candidates, false),
            Err(e) => {
                tracing::warn!(error = %e, "Sparse channel failed");
                (Vec::new(), true)
            }
        };

        if dense_failed && sparse_failed {
            return Err(RagError::Retrieval(
                "both retrieval channels failed".to_string(),
            ));
        }
        if dense_failed && sparse.len() < max_chunks {
            return Err(RagError::Retrieval(format!(
                "dense channel failed and sparse produced only {} of {} results",
                sparse.len(),
                max_chunks
            )));
        }
        if sparse_failed && dense.len() < max_chunks {
            return Err(RagError::Retrieval(format!(
                "sparse channel failed and dense produced only {} of {} results",
                dense.len(),
                max_chunks
            )));
        }

        let mut fused = rrf_fuse(&dense, &sparse, self.settings.rrf_k);

        // Channels see the full index; the candidate-article restriction is
        // applied after fusion
        if let Some(allowed) = article_filter {
            fused.retain(|f| allowed.contains(&f.article_id));
        }

        let cutoff = (max_chunks * 4).max(32);
        fused.truncate(cutoff);

        tracing::debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            fused = fused.len(),
            "Hybrid retrieval complete"
        );

        Ok(RetrievalOutcome {
            fused,
            dense_failed,
            sparse_failed,
        })
    }

    /// Dense ANN query, then drop hits whose version is no longer current
    async fn dense_channel(
        &self,
        planned: &PlannedQuery,
    ) -> Result<Vec<RetrievalCandidate>, RagError> {
        let hits = self
            .vector_index
            .search(&planned.embedding, self.settings.dense_top_k, None)
            .await?;

        let mut article_ids: Vec<String> = hits.iter().map(|h| h.article_id.clone()).collect();
        article_ids.sort();
        article_ids.dedup();
        let current = self.registry.current_many(&article_ids).await?;

        let candidates = hits
            .into_iter()
            .filter(|hit| {
                let version = current.get(&hit.article_id).copied().unwrap_or(NO_VERSION);
                version != NO_VERSION && hit.document_version == version
            })
            .enumerate()
            .map(|(i, hit)| RetrievalCandidate {
                chunk_id: hit.chunk_id,
                article_id: hit.article_id,
                channel: Channel::Dense,
                rank: i + 1,
                raw_score: hit.similarity,
                text: hit.text,
                title: hit.title,
                url: hit.url,
                published_at: hit.published_at,
                document_version: hit.document_version,
            })
            .collect();

        Ok(candidates)
    }

    /// Sparse queries for the primary query and every expanded variant run
    /// concurrently; results merge by chunk id keeping the best per-query
    /// rank. The whole channel fails only when every sub-query fails.
    async fn sparse_channel(
        &self,
        planned: &PlannedQuery,
        user_id: Option<&str>,
    ) -> Result<Vec<RetrievalCandidate>, RagError> {
        let queries: Vec<&str> = planned.sparse_queries().collect();
        let results = join_all(queries.iter().map(|query| {
            self.sparse
                .search(query, user_id, self.settings.sparse_top_k)
        }))
        .await;

        let mut merged: HashMap<String, RetrievalCandidate> = HashMap::new();
        let mut first_error = None;
        let mut any_ok = false;

        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(hits) => {
                    any_ok = true;
                    for (i, hit) in hits.into_iter().enumerate() {
                        let rank = i + 1;
                        match merged.get_mut(&hit.chunk_id) {
                            Some(existing) if existing.rank <= rank => {}
                            Some(existing) => {
                                existing.rank = rank;
                                existing.raw_score = hit.score;
                            }
                            None => {
                                merged.insert(
                                    hit.chunk_id.clone(),
                                    RetrievalCandidate {
                                        chunk_id: hit.chunk_id,
                                        article_id: hit.article_id,
                                        channel: Channel::Sparse,
                                        rank,
                                        raw_score: hit.score,
                                        text: hit.text,
                                        title: hit.title,
                                        url: hit.url,
                                        published_at: hit.published_at,
                                        document_version: hit.document_version,
                                    },
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(query, error = %e, "Sparse sub-query failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if !any_ok {
            return Err(first_error
                .unwrap_or_else(|| RagError::Search("no sparse queries issued".to_string())));
        }

        // Re-rank the merged set: best merged rank first, score breaking ties
        let mut candidates: Vec<RetrievalCandidate> = merged.into_values().collect();
        candidates.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| {
                    b.raw_score
                        .partial_cmp(&a.raw_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        for (i, candidate) in candidates.iter_mut().enumerate() {
            candidate.rank = i + 1;
        }
        candidates.truncate(self.settings.sparse_top_k);

        Ok(candidates)
    }
}

/// Reciprocal rank fusion with constant `k`:
/// `score(c) = Σ over channels 1 / (k + rank_channel(c))`.
///
/// Ties break on higher dense similarity, then more recent `published_at`,
/// then smaller chunk id. The result is a pure function of the per-channel
/// rank lists, independent of input order.
pub fn rrf_fuse(
    dense: &[RetrievalCandidate],
    sparse: &[RetrievalCandidate],
    k: f64,
) -> Vec<FusedResult> {
    let mut by_chunk: HashMap<String, FusedResult> = HashMap::new();

    for candidate in dense {
        let score = 1.0 / (k + candidate.rank as f64);
        let entry = by_chunk
            .entry(candidate.chunk_id.clone())
            .or_insert_with(|| FusedResult {
                chunk_id: candidate.chunk_id.clone(),
                article_id: candidate.article_id.clone(),
                fused_score: 0.0,
                channels: Vec::new(),
                dense_score: None,
                text: candidate.text.clone(),
                title: candidate.title.clone(),
                url: candidate.url.clone(),
                published_at: candidate.published_at,
                document_version: candidate.document_version,
            });
        entry.fused_score += score;
        entry.channels.push(Channel::Dense);
        entry.dense_score = Some(candidate.raw_score);
    }

    for candidate in sparse {
        let score = 1.0 / (k + candidate.rank as f64);
        let entry = by_chunk
            .entry(candidate.chunk_id.clone())
            .or_insert_with(|| FusedResult {
                chunk_id: candidate.chunk_id.clone(),
                article_id: candidate.article_id.clone(),
                fused_score: 0.0,
                channels: Vec::new(),
                dense_score: None,
                text: candidate.text.clone(),
                title: candidate.title.clone(),
                url: candidate.url.clone(),
                published_at: candidate.published_at,
                document_version: candidate.document_version,
            });
        entry.fused_score += score;
        entry.channels.push(Channel::Sparse);
    }

    let mut fused: Vec<FusedResult> = by_chunk.into_values().collect();
    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_dense = a.dense_score.unwrap_or(f32::MIN);
                let b_dense = b.dense_score.unwrap_or(f32::MIN);
                b_dense
                    .partial_cmp(&a_dense)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseHit;
    use crate::vector_store::{ChunkRecord, MemoryIndex};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use quarry_persistence::MemoryVersionRegistry;

    fn candidate(
        chunk_id: &str,
        channel: Channel,
        rank: usize,
        raw_score: f32,
    ) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: chunk_id.to_string(),
            article_id: format!("article-{}", chunk_id),
            channel,
            rank,
            raw_score,
            text: format!("text {}", chunk_id),
            title: None,
            url: None,
            published_at: None,
            document_version: 1,
        }
    }

    #[test]
    fn test_rrf_scores_sum_over_channels() {
        // Dense [C1, C2], sparse [C1]: C1 must fuse first
        let dense = vec![
            candidate("C1", Channel::Dense, 1, 0.9),
            candidate("C2", Channel::Dense, 2, 0.5),
        ];
        let sparse = vec![candidate("C1", Channel::Sparse, 1, 12.0)];

        let fused = rrf_fuse(&dense, &sparse, 60.0);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].chunk_id, "C1");
        assert_eq!(fused[1].chunk_id, "C2");

        let expected = 1.0 / 61.0 + 1.0 / 61.0;
        assert!((fused[0].fused_score - expected).abs() < 1e-12);
        assert_eq!(fused[0].channels.len(), 2);
    }

    #[test]
    fn test_tie_breaks_prefer_dense_similarity_then_recency_then_id() {
        // Same rank in one channel each: fused scores tie
        let older = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let mut a = candidate("a", Channel::Dense, 1, 0.4);
        let mut b = candidate("b", Channel::Dense, 1, 0.7);
        a.published_at = Some(newer);
        b.published_at = Some(older);
        // Higher dense similarity wins despite older timestamp
        let fused = rrf_fuse(&[a.clone()], &[], 60.0);
        assert_eq!(fused[0].chunk_id, "a");
        let fused = rrf_fuse(&[a, b], &[], 60.0);
        assert_eq!(fused[0].chunk_id, "b");

        // Without dense scores, recency wins
        let mut c = candidate("c", Channel::Sparse, 1, 1.0);
        let mut d = candidate("d", Channel::Sparse, 1, 1.0);
        c.published_at = Some(older);
        d.published_at = Some(newer);
        let fused = rrf_fuse(&[], &[c, d], 60.0);
        assert_eq!(fused[0].chunk_id, "d");

        // All else equal, smaller chunk id first
        let e = candidate("e", Channel::Sparse, 1, 1.0);
        let f = candidate("f", Channel::Sparse, 1, 1.0);
        let fused = rrf_fuse(&[], &[f, e], 60.0);
        assert_eq!(fused[0].chunk_id, "e");
    }

    proptest! {
        /// Fusion is a pure function of the rank lists: permuting candidate
        /// order changes nothing.
        #[test]
        fn test_fusion_is_permutation_invariant(
            dense_ids in proptest::collection::vec(0usize..20, 0..10),
            sparse_ids in proptest::collection::vec(0usize..20, 0..10),
            seed in 0u64..1000,
        ) {
            let dense: Vec<RetrievalCandidate> = dense_ids
                .iter()
                .enumerate()
                .map(|(rank, id)| candidate(&format!("c{}", id), Channel::Dense, rank + 1, 0.5))
                .collect();
            let sparse: Vec<RetrievalCandidate> = sparse_ids
                .iter()
                .enumerate()
                .map(|(rank, id)| candidate(&format!("c{}", id), Channel::Sparse, rank + 1, 1.0))
                .collect();

            let baseline = rrf_fuse(&dense, &sparse, 60.0);

            // Deterministic pseudo-shuffle
            let mut dense_shuffled = dense.clone();
            let mut sparse_shuffled = sparse.clone();
            if !dense_shuffled.is_empty() {
                let dense_len = dense_shuffled.len();
                dense_shuffled.rotate_left((seed as usize) % dense_len);
            }
            if !sparse_shuffled.is_empty() {
                let sparse_len = sparse_shuffled.len();
                sparse_shuffled.rotate_left((seed as usize) % sparse_len);
            }
            let shuffled = rrf_fuse(&dense_shuffled, &sparse_shuffled, 60.0);

            let baseline_ids: Vec<&str> = baseline.iter().map(|f| f.chunk_id.as_str()).collect();
            let shuffled_ids: Vec<&str> = shuffled.iter().map(|f| f.chunk_id.as_str()).collect();
            prop_assert_eq!(baseline_ids, shuffled_ids);
        }
    }

    // -- channel integration over the in-memory adapters --------------------

    struct FailingSparse;

    #[async_trait]
    impl SparseSearcher for FailingSparse {
        async fn search(
            &self,
            _: &str,
            _: Option<&str>,
            _: usize,
        ) -> Result<Vec<SparseHit>, RagError> {
            Err(RagError::Connection {
                dependency: "sparse_search",
                message: "down".to_string(),
            })
        }
    }

    struct FixedSparse {
        hits: Vec<SparseHit>,
    }

    #[async_trait]
    impl SparseSearcher for FixedSparse {
        async fn search(
            &self,
            _: &str,
            _: Option<&str>,
            _: usize,
        ) -> Result<Vec<SparseHit>, RagError> {
            Ok(self.hits.clone())
        }
    }

    struct FailingIndex;

    #[async_trait]
    impl crate::vector_store::VectorIndex for FailingIndex {
        async fn ensure_ready(&self) -> Result<(), RagError> {
            Ok(())
        }
        async fn upsert_chunks(&self, _: &[ChunkRecord]) -> Result<(), RagError> {
            Ok(())
        }
        async fn search(
            &self,
            _: &[f32],
            _: usize,
            _: Option<&[String]>,
        ) -> Result<Vec<crate::vector_store::DenseHit>, RagError> {
            Err(RagError::Connection {
                dependency: "vector_store",
                message: "down".to_string(),
            })
        }
        async fn tombstone(&self, _: &str, _: i64) -> Result<(), RagError> {
            Ok(())
        }
    }

    fn sparse_hit(chunk_id: &str, article_id: &str, score: f32) -> SparseHit {
        SparseHit {
            chunk_id: chunk_id.to_string(),
            article_id: article_id.to_string(),
            score,
            text: format!("text {}", chunk_id),
            title: None,
            url: None,
            published_at: None,
            document_version: 1,
            tags: Vec::new(),
        }
    }

    fn planned(embedding: Vec<f32>) -> PlannedQuery {
        PlannedQuery {
            original: "tpu".to_string(),
            normalized: "tpu".to_string(),
            variants: Vec::new(),
            embedding,
            locale: None,
        }
    }

    fn chunk_record(chunk_id: &str, article_id: &str, version: i64, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: chunk_id.to_string(),
            article_id: article_id.to_string(),
            ordinal: 0,
            text: format!("text {}", chunk_id),
            title: "t".to_string(),
            url: "u".to_string(),
            published_at: None,
            document_version: version,
            embedding,
        }
    }

    #[tokio::test]
    async fn test_dense_hits_filtered_to_current_version() {
        let index = Arc::new(MemoryIndex::new());
        index
            .upsert_chunks(&[
                chunk_record("c-old", "a1", 1, vec![1.0, 0.0]),
                chunk_record("c-new", "a1", 2, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let registry = Arc::new(MemoryVersionRegistry::new());
        registry.set_current("a1", 0, 2).await.unwrap();

        let retriever = HybridRetriever::new(
            index,
            Arc::new(FixedSparse { hits: vec![] }),
            registry,
            RetrieverSettings::default(),
        );

        let outcome = retriever
            .retrieve(&planned(vec![1.0, 0.0]), 1, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.fused.len(), 1);
        assert_eq!(outcome.fused[0].chunk_id, "c-new");
    }

    #[tokio::test]
    async fn test_sparse_failure_degrades_when_dense_suffices() {
        let index = Arc::new(MemoryIndex::new());
        index
            .upsert_chunks(&[
                chunk_record("c1", "a1", 1, vec![1.0, 0.0]),
                chunk_record("c2", "a2", 1, vec![0.9, 0.1]),
            ])
            .await
            .unwrap();
        let registry = Arc::new(MemoryVersionRegistry::new());
        registry.set_current("a1", 0, 1).await.unwrap();
        registry.set_current("a2", 0, 1).await.unwrap();

        let retriever = HybridRetriever::new(
            index,
            Arc::new(FailingSparse),
            registry,
            RetrieverSettings::default(),
        );

        let outcome = retriever
            .retrieve(&planned(vec![1.0, 0.0]), 2, None, None)
            .await
            .unwrap();
        assert!(outcome.sparse_failed);
        assert!(!outcome.dense_failed);
        assert_eq!(outcome.fused.len(), 2);
    }

    #[tokio::test]
    async fn test_both_channels_failing_is_an_error() {
        let retriever = HybridRetriever::new(
            Arc::new(FailingIndex),
            Arc::new(FailingSparse),
            Arc::new(MemoryVersionRegistry::new()),
            RetrieverSettings::default(),
        );

        let err = retriever
            .retrieve(&planned(vec![1.0, 0.0]), 2, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Retrieval(_)));
    }

    #[tokio::test]
    async fn test_one_channel_failing_with_too_few_results_is_an_error() {
        let retriever = HybridRetriever::new(
            Arc::new(FailingIndex),
            Arc::new(FixedSparse {
                hits: vec![sparse_hit("c1", "a1", 2.0)],
            }),
            Arc::new(MemoryVersionRegistry::new()),
            RetrieverSettings::default(),
        );

        // Sparse produced 1 < max_chunks = 3 while dense failed
        let err = retriever
            .retrieve(&planned(vec![1.0, 0.0]), 3, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Retrieval(_)));
    }

    #[tokio::test]
    async fn test_article_filter_applies_after_fusion() {
        let index = Arc::new(MemoryIndex::new());
        index
            .upsert_chunks(&[
                chunk_record("c1", "a1", 1, vec![1.0, 0.0]),
                chunk_record("c2", "a2", 1, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let registry = Arc::new(MemoryVersionRegistry::new());
        registry.set_current("a1", 0, 1).await.unwrap();
        registry.set_current("a2", 0, 1).await.unwrap();

        let retriever = HybridRetriever::new(
            index,
            Arc::new(FixedSparse { hits: vec![] }),
            registry,
            RetrieverSettings::default(),
        );

        let allowed = vec!["a2".to_string()];
        let outcome = retriever
            .retrieve(&planned(vec![1.0, 0.0]), 1, Some(&allowed), None)
            .await
            .unwrap();
        assert_eq!(outcome.fused.len(), 1);
        assert_eq!(outcome.fused[0].article_id, "a2");
    }
}
