//! Quarry server
//!
//! HTTP surface, SSE streaming, background workers and process wiring for
//! the RAG orchestrator.

pub mod http;
pub mod metrics;
pub mod sse;
pub mod state;
pub mod worker;

pub use http::create_router;
pub use metrics::{init_metrics, metrics_handler};
pub use state::AppState;
pub use worker::spawn_workers;
