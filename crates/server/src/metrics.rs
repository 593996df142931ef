//! Prometheus metrics
//!
//! A process-wide recorder installed at startup; the handle renders the
//! exposition format for `GET /metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Safe to call once per process.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    match HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// Render the exposition format
pub async fn metrics_handler() -> String {
    HANDLE.get().map(|h| h.render()).unwrap_or_default()
}

/// Record a completed answer request
pub fn record_answer(fallback: bool, reason: Option<&str>) {
    if fallback {
        metrics::counter!(
            "quarry_answer_fallbacks_total",
            "reason" => reason.unwrap_or("unknown").to_string()
        )
        .increment(1);
    } else {
        metrics::counter!("quarry_answers_total").increment(1);
    }
}

/// Record a degraded rerank stage
pub fn record_rerank_skipped() {
    metrics::counter!("quarry_rerank_skipped_total").increment(1);
}

/// Record a job outcome
pub fn record_job(job_type: &str, outcome: &str) {
    metrics::counter!(
        "quarry_jobs_total",
        "type" => job_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an indexed upsert
pub fn record_upsert() {
    metrics::counter!("quarry_upserts_total").increment(1);
}
