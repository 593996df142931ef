//! HTTP endpoints
//!
//! The public retrieval/answer surface, the internal indexing surface, and
//! the operational probes. Errors carry a machine-readable reason code and a
//! correlation id; degradable failures never reach this layer (the pipeline
//! absorbs them into fallback responses).

use axum::{
    extract::{Json, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use quarry_core::{
    Article, DebugMeta, Error as CoreError, JobType, RagJob, RerankedContext,
};
use quarry_rag::{HttpEmbedder, HttpEmbedderConfig};
use quarry_synthesis::AnswerRequest;

use crate::metrics::{self, metrics_handler};
use crate::sse::to_sse_event;
use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let config = state.config.read();
    let cors_layer = build_cors_layer(&config.server.cors_origins, config.server.cors_enabled);
    drop(config);

    Router::new()
        // Public retrieval surface
        .route("/v1/rag/retrieve", post(retrieve))
        .route("/v1/rag/answer", post(answer))
        .route("/v1/rag/answer/stream", post(answer_stream))
        // Internal indexing surface
        .route("/internal/rag/index/upsert", post(index_upsert))
        .route("/internal/rag/index/delete", post(index_delete))
        .route("/internal/rag/backfill", post(backfill))
        // Operational
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        return CorsLayer::new();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!(origin, "Invalid CORS origin");
                None
            })
        })
        .collect();

    if parsed.is_empty() {
        tracing::warn!("CORS enabled with no valid origins, allowing none");
        return CorsLayer::new();
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// HTTP error with a machine-readable reason code and correlation id
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
    message: String,
    correlation_id: String,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::DependencyUnavailable { .. } | CoreError::RetrievalFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            CoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Ungrounded(_) | CoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            reason: err.reason_code(),
            message: err.to_string(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(
            correlation_id = %self.correlation_id,
            reason = self.reason,
            status = %self.status,
            "{}",
            self.message
        );
        (
            self.status,
            Json(serde_json::json!({
                "error": self.message,
                "reason": self.reason,
                "correlation_id": self.correlation_id,
            })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Retrieval surface
// ---------------------------------------------------------------------------

/// Retrieve/answer request body
#[derive(Debug, Deserialize)]
struct QueryRequestBody {
    query: String,
    candidate_article_ids: Option<Vec<String>>,
    locale: Option<String>,
    user_id: Option<String>,
    max_chunks: Option<usize>,
    max_tokens: Option<usize>,
}

impl From<QueryRequestBody> for AnswerRequest {
    fn from(body: QueryRequestBody) -> Self {
        AnswerRequest {
            query: body.query,
            candidate_article_ids: body.candidate_article_ids,
            locale: body.locale,
            user_id: body.user_id,
            max_chunks: body.max_chunks,
            max_tokens: body.max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct RetrieveResponseBody {
    contexts: Vec<RerankedContext>,
    debug: DebugMeta,
}

/// Retrieve-only: fused and reranked contexts without answer synthesis
async fn retrieve(
    State(state): State<AppState>,
    Json(body): Json<QueryRequestBody>,
) -> Result<Json<RetrieveResponseBody>, ApiError> {
    let req: AnswerRequest = body.into();
    let output = state.pipeline.retrieve_contexts(&req).await?;

    if output.debug.rerank_skipped {
        metrics::record_rerank_skipped();
    }

    Ok(Json(RetrieveResponseBody {
        contexts: output.contexts,
        debug: output.debug,
    }))
}

/// Unary answer with citations
async fn answer(
    State(state): State<AppState>,
    Json(body): Json<QueryRequestBody>,
) -> Result<Response, ApiError> {
    let req: AnswerRequest = body.into();
    let response = state.pipeline.answer(req).await?;

    metrics::record_answer(response.fallback, response.reason.as_deref());
    if response.debug.rerank_skipped {
        metrics::record_rerank_skipped();
    }

    Ok(Json(response).into_response())
}

/// Streaming answer over SSE
async fn answer_stream(
    State(state): State<AppState>,
    Json(body): Json<QueryRequestBody>,
) -> Result<Response, ApiError> {
    let req: AnswerRequest = body.into();
    // Validate before committing to the stream so a bad request still gets
    // a 400 instead of an event
    req.validate()?;

    let keepalive = {
        let config = state.config.read();
        Duration::from_secs(config.synthesis.sse_keepalive_secs)
    };

    let pipeline = Arc::clone(&state.pipeline);
    let events = pipeline.answer_stream(req).map(|event| to_sse_event(&event));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(keepalive))
        .into_response())
}

// ---------------------------------------------------------------------------
// Indexing surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpsertRequestBody {
    article_id: String,
    title: String,
    url: String,
    body: String,
    published_at: Option<chrono::DateTime<chrono::Utc>>,
    feed_id: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpsertResponseBody {
    article_id: String,
    document_version: i64,
}

/// Synchronous upsert. `X-Embedder-URL` swaps the embedding backend for this
/// request only; chunking, versioning and the transaction are unchanged.
async fn index_upsert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpsertRequestBody>,
) -> Result<Json<UpsertResponseBody>, ApiError> {
    let article = Article {
        article_id: body.article_id,
        title: body.title,
        url: body.url,
        body: body.body,
        published_at: body.published_at,
        feed_id: body.feed_id,
        tags: body.tags,
        user_id: body.user_id,
    };

    let upsert_timeout = {
        let config = state.config.read();
        Duration::from_secs(config.indexing.upsert_timeout_secs)
    };

    let override_endpoint = headers
        .get("x-embedder-url")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let version = tokio::time::timeout(upsert_timeout, async {
        match override_endpoint {
            Some(endpoint) => {
                tracing::info!(endpoint = %endpoint, "Using per-request embedder override");
                let embedder_config = {
                    let config = state.config.read();
                    HttpEmbedderConfig::from_settings(&config.embedding).with_endpoint(endpoint)
                };
                let embedder =
                    HttpEmbedder::new(embedder_config).map_err(CoreError::from)?;
                state
                    .indexer
                    .upsert_with_embedder(&article, &embedder)
                    .await
                    .map_err(CoreError::from)
            }
            None => state
                .indexer
                .upsert(&article)
                .await
                .map_err(CoreError::from),
        }
    })
    .await
    .map_err(|_| ApiError::from(CoreError::Timeout))??;

    metrics::record_upsert();

    Ok(Json(UpsertResponseBody {
        article_id: article.article_id,
        document_version: version,
    }))
}

#[derive(Debug, Deserialize)]
struct ArticleIdBody {
    article_id: String,
}

/// Tombstone an article
async fn index_delete(
    State(state): State<AppState>,
    Json(body): Json<ArticleIdBody>,
) -> Result<StatusCode, ApiError> {
    state
        .indexer
        .delete(&body.article_id)
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct BackfillResponseBody {
    job_id: Uuid,
}

/// Enqueue a backfill job for asynchronous indexing
async fn backfill(
    State(state): State<AppState>,
    Json(body): Json<ArticleIdBody>,
) -> Result<(StatusCode, Json<BackfillResponseBody>), ApiError> {
    if body.article_id.trim().is_empty() {
        return Err(CoreError::InvalidArgument("empty article_id".to_string()).into());
    }

    let job = RagJob::new(
        JobType::BackfillArticle,
        serde_json::json!({ "article_id": body.article_id }),
    );
    state
        .job_store
        .enqueue(&job)
        .await
        .map_err(|e| ApiError::from(CoreError::from(e)))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BackfillResponseBody { job_id: job.id }),
    ))
}

// ---------------------------------------------------------------------------
// Operational
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.get_config();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": config.environment,
    }))
}

/// Readiness: the LLM backend must be reachable
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let llm_ok = state.llm.is_available().await;

    let status_code = if llm_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(serde_json::json!({
            "status": if llm_ok { "ready" } else { "not_ready" },
            "checks": {
                "llm_backend": { "status": if llm_ok { "ok" } else { "unreachable" } },
            }
        })),
    )
}
