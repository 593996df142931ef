//! Answer pipeline
//!
//! Composes planner, retriever, reranker and LLM. The streaming path is an
//! `async_stream` generator: dropping it (client disconnect) drops the
//! in-flight LLM future, which aborts the upstream request. Event ordering
//! per request: one `meta`, zero or more `delta`, one terminal `done` or
//! `fallback`; a deadline expiry terminates the stream with no terminal
//! event.

use async_stream::stream;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use quarry_core::{
    AnswerEvent, AnswerResponse, DebugMeta, Error as CoreError, FallbackReason, RerankedContext,
};
use quarry_llm::{GenerateOptions, LlmBackend, Message};
use quarry_rag::{apply_rerank, HybridRetriever, QueryPlanner, Reranker};

use crate::prompt::{build_messages, PromptBudgets};
use crate::schema::{answer_schema, hydrate_citations, parse_answer, CitationCheck, LlmAnswer};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub prompt_version: String,
    pub budgets: PromptBudgets,
    /// End-to-end deadline for one request
    pub deadline: Duration,
    pub default_max_chunks: usize,
    pub hard_max_chunks: usize,
    pub default_max_tokens: usize,
    /// Cross-encoder batch cap
    pub rerank_batch: usize,
    /// Ask the backend for schema-constrained decoding
    pub structured_output: bool,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            prompt_version: "rag-answer-v2".to_string(),
            budgets: PromptBudgets::default(),
            deadline: Duration::from_secs(90),
            default_max_chunks: 5,
            hard_max_chunks: 20,
            default_max_tokens: 1024,
            rerank_batch: 32,
            structured_output: true,
        }
    }
}

impl SynthesisSettings {
    pub fn from_settings(settings: &quarry_config::Settings) -> Self {
        Self {
            prompt_version: settings.synthesis.prompt_version.clone(),
            budgets: PromptBudgets {
                chunk_chars: settings.synthesis.chunk_char_budget,
                total_chars: settings.synthesis.context_char_budget,
            },
            deadline: Duration::from_secs(settings.synthesis.stream_deadline_secs),
            default_max_chunks: settings.retrieval.default_max_chunks,
            hard_max_chunks: settings.retrieval.hard_max_chunks,
            default_max_tokens: settings.synthesis.default_max_tokens,
            rerank_batch: settings.rerank.batch_size,
            structured_output: settings.llm.structured_output,
        }
    }
}

/// One answer or retrieve request
#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub query: String,
    pub candidate_article_ids: Option<Vec<String>>,
    pub locale: Option<String>,
    pub user_id: Option<String>,
    pub max_chunks: Option<usize>,
    pub max_tokens: Option<usize>,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Pre-flight validation; the HTTP layer calls this before opening an
    /// SSE stream so a 400 can still be returned
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.query.trim().is_empty() {
            return Err(CoreError::InvalidArgument("empty query".to_string()));
        }
        Ok(())
    }
}

/// Retrieval output shared by the retrieve-only route and the answer path
#[derive(Debug, Clone)]
pub struct RetrieveOutput {
    pub contexts: Vec<RerankedContext>,
    pub debug: DebugMeta,
}

/// The answer pipeline
pub struct AnswerPipeline {
    planner: Arc<QueryPlanner>,
    retriever: Arc<HybridRetriever>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Arc<dyn LlmBackend>,
    settings: SynthesisSettings,
}

impl AnswerPipeline {
    pub fn new(
        planner: Arc<QueryPlanner>,
        retriever: Arc<HybridRetriever>,
        reranker: Option<Arc<dyn Reranker>>,
        llm: Arc<dyn LlmBackend>,
        settings: SynthesisSettings,
    ) -> Self {
        Self {
            planner,
            retriever,
            reranker,
            llm,
            settings,
        }
    }

    fn max_chunks(&self, req: &AnswerRequest) -> usize {
        req.max_chunks
            .unwrap_or(self.settings.default_max_chunks)
            .clamp(1, self.settings.hard_max_chunks)
    }

    fn generate_options(&self, req: &AnswerRequest) -> GenerateOptions {
        GenerateOptions {
            max_tokens: req.max_tokens.unwrap_or(self.settings.default_max_tokens),
            format: self.settings.structured_output.then(answer_schema),
        }
    }

    /// Plan, retrieve and rerank. Zero contexts is not an error; channel or
    /// dependency failures are.
    pub async fn retrieve_contexts(&self, req: &AnswerRequest) -> Result<RetrieveOutput, CoreError> {
        req.validate()?;
        let max_chunks = self.max_chunks(req);

        let planned = self
            .planner
            .plan(&req.query, req.locale.as_deref())
            .await
            .map_err(CoreError::from)?;

        let outcome = self
            .retriever
            .retrieve(
                &planned,
                max_chunks,
                req.candidate_article_ids.as_deref(),
                req.user_id.as_deref(),
            )
            .await
            .map_err(CoreError::from)?;

        let (contexts, rerank_skipped) = apply_rerank(
            self.reranker.as_deref(),
            &planned.normalized,
            outcome.fused,
            max_chunks,
            self.settings.rerank_batch,
        )
        .await;

        let debug = DebugMeta {
            retrieval_set_id: Uuid::new_v4().to_string(),
            prompt_version: self.settings.prompt_version.clone(),
            rerank_skipped,
        };

        Ok(RetrieveOutput { contexts, debug })
    }

    /// Unary answer with citations
    pub async fn answer(&self, req: AnswerRequest) -> Result<AnswerResponse, CoreError> {
        req.validate()?;
        tokio::time::timeout(self.settings.deadline, self.answer_inner(req))
            .await
            .map_err(|_| CoreError::Timeout)?
    }

    async fn answer_inner(&self, req: AnswerRequest) -> Result<AnswerResponse, CoreError> {
        let output = match self.retrieve_contexts(&req).await {
            Ok(output) => output,
            Err(e @ CoreError::InvalidArgument(_)) => return Err(e),
            Err(e @ CoreError::Internal(_)) => return Err(e),
            Err(e) => {
                // Degrade: a retrieval-side dependency failure still yields a
                // well-formed fallback response
                tracing::warn!(error = %e, "Retrieval failed, answering with fallback");
                return Ok(AnswerResponse::fallback(
                    FallbackReason::DependencyUnavailable,
                    Vec::new(),
                    DebugMeta {
                        retrieval_set_id: Uuid::new_v4().to_string(),
                        prompt_version: self.settings.prompt_version.clone(),
                        rerank_skipped: false,
                    },
                ));
            }
        };

        let (messages, kept) = build_messages(
            &req.query,
            &output.contexts,
            req.locale.as_deref(),
            self.settings.budgets,
        );
        let debug = output.debug;

        if kept.is_empty() {
            return Ok(AnswerResponse::fallback(
                FallbackReason::NoContext,
                kept,
                debug,
            ));
        }

        let opts = self.generate_options(&req);
        let text = match self.generate_with_retry(&messages, &opts).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "LLM unavailable");
                return Ok(AnswerResponse::fallback(
                    FallbackReason::LlmUnavailable,
                    kept,
                    debug,
                ));
            }
        };

        Ok(self.finalize(&text, kept, debug))
    }

    /// Unary generation; an empty completion counts as a transient failure
    /// and is retried once alongside transport errors.
    async fn generate_with_retry(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
    ) -> Result<String, CoreError> {
        let first = self.llm.generate(messages, opts).await;
        match first {
            Ok(result) if !result.text.trim().is_empty() => Ok(result.text),
            Ok(_) => {
                tracing::warn!("Empty completion, retrying once");
                let second = self.llm.generate(messages, opts).await.map_err(CoreError::from)?;
                Ok(second.text)
            }
            Err(e) => Err(CoreError::from(e)),
        }
    }

    /// Parse, validate and hydrate the completed model text into a final
    /// response. Parse and grounding violations become fallback responses.
    fn finalize(
        &self,
        text: &str,
        contexts: Vec<RerankedContext>,
        debug: DebugMeta,
    ) -> AnswerResponse {
        let parsed: LlmAnswer = match parse_answer(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable model output");
                return AnswerResponse::fallback(FallbackReason::LlmUnavailable, contexts, debug);
            }
        };

        if parsed.fallback {
            tracing::info!(model_reason = %parsed.reason, "Model declined to answer");
            return AnswerResponse::fallback(FallbackReason::NoCitations, contexts, debug);
        }

        match hydrate_citations(&parsed, &contexts) {
            CitationCheck::Valid(citations) => {
                let response = AnswerResponse {
                    answer: parsed.answer,
                    citations,
                    contexts,
                    fallback: false,
                    reason: None,
                    debug,
                };
                debug_assert!(response.is_well_formed());
                response
            }
            CitationCheck::Ungrounded => {
                tracing::warn!("Model cited a chunk outside the context set");
                AnswerResponse::fallback(FallbackReason::UngroundedCitation, contexts, debug)
            }
            CitationCheck::NoCitations => {
                AnswerResponse::fallback(FallbackReason::NoCitations, contexts, debug)
            }
        }
    }

    /// Streamed answer. `meta` is emitted as soon as the context set is
    /// fixed; deltas carry answer-bearing content only; the terminal event is
    /// `done` or `fallback`. On deadline the stream ends with no terminal
    /// event; on consumer drop every in-flight future is dropped with it.
    pub fn answer_stream(
        self: Arc<Self>,
        req: AnswerRequest,
    ) -> impl Stream<Item = AnswerEvent> + Send {
        stream! {
            let deadline = tokio::time::sleep(self.settings.deadline);
            tokio::pin!(deadline);

            // Stage 1: fix the context set
            let retrieve = self.retrieve_contexts(&req);
            tokio::pin!(retrieve);
            let output = tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!("Deadline expired during retrieval");
                    return;
                }
                result = &mut retrieve => result,
            };

            let empty_debug = || DebugMeta {
                retrieval_set_id: Uuid::new_v4().to_string(),
                prompt_version: self.settings.prompt_version.clone(),
                rerank_skipped: false,
            };

            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(error = %e, "Retrieval failed, streaming fallback");
                    let debug = empty_debug();
                    yield AnswerEvent::Meta { contexts: Vec::new(), debug: debug.clone() };
                    yield AnswerEvent::Fallback {
                        reason: FallbackReason::DependencyUnavailable,
                        partial: String::new(),
                        debug,
                    };
                    return;
                }
            };

            let (messages, kept) = build_messages(
                &req.query,
                &output.contexts,
                req.locale.as_deref(),
                self.settings.budgets,
            );
            let debug = output.debug;

            yield AnswerEvent::Meta { contexts: kept.clone(), debug: debug.clone() };

            if kept.is_empty() {
                yield AnswerEvent::Fallback {
                    reason: FallbackReason::NoContext,
                    partial: String::new(),
                    debug,
                };
                return;
            }

            // Stage 2: stream the model, retrying once if it fails before
            // producing any output
            let opts = self.generate_options(&req);
            let mut attempt = 0u32;
            let final_text;
            loop {
                attempt += 1;
                let (tx, mut rx) = mpsc::channel(32);
                let llm_stream = self.llm.chat_stream(&messages, &opts, tx);
                tokio::pin!(llm_stream);

                let mut stream_result = None;
                let mut accumulated = String::new();

                loop {
                    enum Step {
                        Deadline,
                        Finished(Result<quarry_llm::StreamStats, quarry_llm::LlmError>),
                        Chunk(quarry_llm::StreamChunk),
                        Closed,
                    }

                    let step = tokio::select! {
                        _ = &mut deadline => Step::Deadline,
                        result = &mut llm_stream, if stream_result.is_none() => {
                            Step::Finished(result)
                        }
                        chunk = rx.recv() => match chunk {
                            Some(chunk) => Step::Chunk(chunk),
                            None => Step::Closed,
                        },
                    };

                    match step {
                        Step::Deadline => {
                            // Dropping the pinned LLM future aborts the
                            // upstream request; no terminal event
                            tracing::warn!("Deadline expired during generation");
                            return;
                        }
                        Step::Finished(result) => {
                            stream_result = Some(result);
                        }
                        Step::Chunk(chunk) => {
                            // Thinking traces are consumed, never surfaced
                            if !chunk.content.is_empty() {
                                accumulated.push_str(&chunk.content);
                                yield AnswerEvent::Delta { text: chunk.content };
                            }
                        }
                        Step::Closed => break,
                    }
                }

                let result = match stream_result {
                    Some(result) => result,
                    None => tokio::select! {
                        _ = &mut deadline => {
                            tracing::warn!("Deadline expired finishing generation");
                            return;
                        }
                        result = &mut llm_stream => result,
                    },
                };

                match result {
                    Ok(_) if accumulated.trim().is_empty() && attempt == 1 => {
                        tracing::warn!("Empty stream, retrying once");
                        continue;
                    }
                    Ok(_) => {
                        final_text = accumulated;
                        break;
                    }
                    Err(e) if e.is_transient() && accumulated.is_empty() && attempt == 1 => {
                        tracing::warn!(error = %e, "LLM stream failed before output, retrying once");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "LLM stream failed");
                        yield AnswerEvent::Fallback {
                            reason: FallbackReason::LlmUnavailable,
                            partial: accumulated,
                            debug,
                        };
                        return;
                    }
                }
            }

            let response = self.finalize(&final_text, kept, debug);
            if response.fallback {
                let reason = match response.reason.as_deref() {
                    Some("ungrounded_citation") => FallbackReason::UngroundedCitation,
                    Some("no_citations") => FallbackReason::NoCitations,
                    _ => FallbackReason::LlmUnavailable,
                };
                yield AnswerEvent::Fallback {
                    reason,
                    partial: final_text,
                    debug: response.debug,
                };
            } else {
                yield AnswerEvent::Done { response };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use quarry_core::Article;
    use quarry_llm::{GenerationResult, StreamChunk, StreamStats};
    use quarry_persistence::MemoryVersionRegistry;
    use quarry_rag::{
        Chunker, ChunkerConfig, Embedder, HybridRetriever, Indexer, IndexerSettings,
        MemoryIndex, NoExpansion, PlannerSettings, QueryPlanner, RagError, RerankScore, Reranker,
        RetrieverSettings, TantivySparseIndex, VectorIndex,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    // -- scripted adapters ---------------------------------------------------

    struct TestEmbedder;

    #[async_trait]
    impl Embedder for TestEmbedder {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; 8];
                    for (i, b) in text.bytes().enumerate() {
                        v[i % 8] += b as f32 / 255.0;
                    }
                    v
                })
                .collect())
        }

        fn dim(&self) -> usize {
            8
        }

        fn model(&self) -> &str {
            "test"
        }
    }

    /// LLM that replays a scripted unary response and a scripted chunk
    /// sequence, optionally stalling to let tests exercise cancellation
    struct ScriptedLlm {
        unary: Mutex<Vec<Result<String, quarry_llm::LlmError>>>,
        chunks: Vec<String>,
        stall_after: Option<usize>,
        dropped: Arc<AtomicBool>,
    }

    impl ScriptedLlm {
        fn unary_ok(text: &str) -> Self {
            Self {
                unary: Mutex::new(vec![Ok(text.to_string())]),
                chunks: split_script(text),
                stall_after: None,
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn streaming(chunks: Vec<String>, stall_after: Option<usize>) -> Self {
            Self {
                unary: Mutex::new(Vec::new()),
                chunks,
                stall_after,
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    fn split_script(text: &str) -> Vec<String> {
        text.as_bytes()
            .chunks(12)
            .map(|c| String::from_utf8_lossy(c).to_string())
            .collect()
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn generate(
            &self,
            _: &[Message],
            _: &GenerateOptions,
        ) -> Result<GenerationResult, quarry_llm::LlmError> {
            let mut scripted = self.unary.lock();
            let next = if scripted.is_empty() {
                Ok(String::new())
            } else {
                scripted.remove(0)
            };
            next.map(|text| GenerationResult {
                text,
                tokens: 10,
                total_time_ms: 5,
                finish_reason: quarry_llm::FinishReason::Stop,
            })
        }

        async fn chat_stream(
            &self,
            _: &[Message],
            _: &GenerateOptions,
            tx: mpsc::Sender<StreamChunk>,
        ) -> Result<StreamStats, quarry_llm::LlmError> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));

            for (i, content) in self.chunks.iter().enumerate() {
                if self.stall_after == Some(i) {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                if tx
                    .send(StreamChunk {
                        content: content.clone(),
                        thinking: None,
                        done: false,
                        eval_count: None,
                    })
                    .await
                    .is_err()
                {
                    return Err(quarry_llm::LlmError::Cancelled);
                }
            }

            Ok(StreamStats {
                tokens: self.chunks.len(),
                time_to_first_token_ms: Some(1),
                total_time_ms: 2,
                finish_reason: quarry_llm::FinishReason::Stop,
            })
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn rerank(&self, _: &str, _: &[String]) -> Result<Vec<RerankScore>, RagError> {
            Err(RagError::Connection {
                dependency: "reranker",
                message: "500".to_string(),
            })
        }
    }

    // -- fixture -------------------------------------------------------------

    struct Fixture {
        index: Arc<MemoryIndex>,
        registry: Arc<MemoryVersionRegistry>,
        sparse: TantivySparseIndex,
        chunk_ids: Vec<String>,
    }

    /// Index two articles (one about TPUs, one unrelated) through the real
    /// indexer and collect the resulting chunk ids
    async fn fixture() -> Fixture {
        let index = Arc::new(MemoryIndex::new());
        let registry = Arc::new(MemoryVersionRegistry::new());
        let sparse = TantivySparseIndex::new(Default::default()).unwrap();

        let indexer = Indexer::new(
            Chunker::new(ChunkerConfig {
                target_tokens: 100,
                overlap_tokens: 10,
            }),
            Arc::new(TestEmbedder),
            index.clone(),
            registry.clone(),
            IndexerSettings::default(),
        )
        .with_sparse_index(sparse.clone());

        indexer
            .upsert(&Article::new(
                "a1",
                "TPU article",
                "http://example.com/tpu",
                "The TPU is a custom accelerator designed for tensor workloads.",
            ))
            .await
            .unwrap();
        indexer
            .upsert(&Article::new(
                "a2",
                "Cooking article",
                "http://example.com/pasta",
                "Pasta should be cooked in salted boiling water until al dente.",
            ))
            .await
            .unwrap();

        let hits = index.search(&vec![0.5; 8], 10, None).await.unwrap();
        let chunk_ids = hits.into_iter().map(|h| h.chunk_id).collect();

        Fixture {
            index,
            registry,
            sparse,
            chunk_ids,
        }
    }

    fn pipeline_with(fixture: &Fixture, llm: ScriptedLlm, reranker: Option<Arc<dyn Reranker>>) -> Arc<AnswerPipeline> {
        let planner = Arc::new(QueryPlanner::new(
            Arc::new(TestEmbedder),
            Arc::new(NoExpansion),
            PlannerSettings::default(),
        ));
        let retriever = Arc::new(HybridRetriever::new(
            fixture.index.clone(),
            Arc::new(fixture.sparse.clone()),
            fixture.registry.clone(),
            RetrieverSettings::default(),
        ));
        Arc::new(AnswerPipeline::new(
            planner,
            retriever,
            reranker,
            Arc::new(llm),
            SynthesisSettings {
                deadline: Duration::from_secs(5),
                ..Default::default()
            },
        ))
    }

    fn grounded_answer(chunk_id: &str) -> String {
        format!(
            r#"{{"answer":"The TPU is a tensor accelerator [{}]","citations":[{{"chunk_id":"{}"}}],"fallback":false,"reason":""}}"#,
            chunk_id, chunk_id
        )
    }

    // -- scenarios -----------------------------------------------------------

    #[tokio::test]
    async fn test_hybrid_happy_path_unary() {
        let fixture = fixture().await;
        // Both fixture chunks land in the context set (max_chunks = 5), so
        // citing either is grounded
        let tpu_chunk = fixture.chunk_ids[0].clone();
        let llm = ScriptedLlm::unary_ok(&grounded_answer(&tpu_chunk));
        let pipeline = pipeline_with(&fixture, llm, None);

        let response = pipeline
            .answer(AnswerRequest::new("TPU"))
            .await
            .unwrap();

        assert!(!response.fallback);
        assert_eq!(response.citations.len(), 1);
        assert_eq!(response.citations[0].chunk_id, tpu_chunk);
        assert!(response.is_well_formed());
        assert!(response.debug.rerank_skipped, "no reranker configured");
    }

    #[tokio::test]
    async fn test_empty_retrieval_streams_meta_then_fallback() {
        let fixture = Fixture {
            index: Arc::new(MemoryIndex::new()),
            registry: Arc::new(MemoryVersionRegistry::new()),
            sparse: TantivySparseIndex::new(Default::default()).unwrap(),
            chunk_ids: Vec::new(),
        };
        let llm = ScriptedLlm::unary_ok("unused");
        let pipeline = pipeline_with(&fixture, llm, None);

        let events: Vec<AnswerEvent> = pipeline
            .answer_stream(AnswerRequest::new("nonexistent-topic-xyz"))
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AnswerEvent::Meta { ref contexts, .. } if contexts.is_empty()));
        assert!(matches!(
            events[1],
            AnswerEvent::Fallback {
                reason: FallbackReason::NoContext,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ungrounded_citation_falls_back() {
        let fixture = fixture().await;
        let llm = ScriptedLlm::unary_ok(
            r#"{"answer":"something","citations":[{"chunk_id":"UNKNOWN"}],"fallback":false,"reason":""}"#,
        );
        let pipeline = pipeline_with(&fixture, llm, None);

        let response = pipeline.answer(AnswerRequest::new("TPU")).await.unwrap();
        assert!(response.fallback);
        assert_eq!(response.reason.as_deref(), Some("ungrounded_citation"));
        assert!(response.answer.is_empty());
        assert!(response.is_well_formed());
    }

    #[tokio::test]
    async fn test_reranker_down_still_answers_with_skip_flag() {
        let fixture = fixture().await;
        let tpu_chunk = fixture.chunk_ids[0].clone();
        let llm = ScriptedLlm::unary_ok(&grounded_answer(&tpu_chunk));
        let pipeline = pipeline_with(&fixture, llm, Some(Arc::new(BrokenReranker)));

        let response = pipeline.answer(AnswerRequest::new("TPU")).await.unwrap();
        assert!(!response.fallback);
        assert!(response.debug.rerank_skipped);
    }

    #[tokio::test]
    async fn test_stream_ordering_happy_path() {
        let fixture = fixture().await;
        let tpu_chunk = fixture.chunk_ids[0].clone();
        let llm = ScriptedLlm::streaming(split_script(&grounded_answer(&tpu_chunk)), None);
        let pipeline = pipeline_with(&fixture, llm, None);

        let events: Vec<AnswerEvent> = pipeline
            .answer_stream(AnswerRequest::new("TPU"))
            .collect()
            .await;

        // Exactly one meta, first; exactly one terminal, last; deltas between
        assert!(matches!(events.first(), Some(AnswerEvent::Meta { .. })));
        let meta_count = events
            .iter()
            .filter(|e| matches!(e, AnswerEvent::Meta { .. }))
            .count();
        assert_eq!(meta_count, 1);
        let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminal_count, 1);
        assert!(events.last().unwrap().is_terminal());
        assert!(events.len() > 2, "expected at least one delta");

        match events.last().unwrap() {
            AnswerEvent::Done { response } => {
                assert!(!response.fallback);
                assert_eq!(response.citations[0].chunk_id, tpu_chunk);
            }
            other => panic!("expected done, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_stream_cancellation_aborts_llm() {
        let fixture = fixture().await;
        let chunks: Vec<String> = (0..50).map(|i| format!("part{} ", i)).collect();
        // Stall after the third chunk so the consumer can drop mid-stream
        let llm = ScriptedLlm::streaming(chunks, Some(3));
        let dropped = Arc::clone(&llm.dropped);
        let pipeline = pipeline_with(&fixture, llm, None);

        let mut stream = Box::pin(pipeline.answer_stream(AnswerRequest::new("TPU")));
        // Meta + a couple of deltas
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        drop(stream);

        // The in-flight LLM future must be dropped promptly
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected_before_streaming() {
        let fixture = fixture().await;
        let llm = ScriptedLlm::unary_ok("unused");
        let pipeline = pipeline_with(&fixture, llm, None);

        let err = pipeline.answer(AnswerRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_unparseable_output_falls_back_llm_unavailable() {
        let fixture = fixture().await;
        let llm = ScriptedLlm::unary_ok("I am not JSON at all");
        let pipeline = pipeline_with(&fixture, llm, None);

        let response = pipeline.answer(AnswerRequest::new("TPU")).await.unwrap();
        assert!(response.fallback);
        assert_eq!(response.reason.as_deref(), Some("llm_unavailable"));
    }

    #[tokio::test]
    async fn test_model_declared_fallback_has_empty_answer() {
        let fixture = fixture().await;
        let llm = ScriptedLlm::unary_ok(
            r#"{"answer":"","citations":[],"fallback":true,"reason":"not enough context"}"#,
        );
        let pipeline = pipeline_with(&fixture, llm, None);

        let response = pipeline.answer(AnswerRequest::new("TPU")).await.unwrap();
        assert!(response.fallback);
        assert!(response.answer.is_empty());
        assert!(response.reason.is_some());
        assert!(response.is_well_formed());
    }
}
