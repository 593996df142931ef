//! LLM integration
//!
//! Features:
//! - `LlmBackend` capability trait with unary and streaming generation
//! - Ollama-compatible HTTP backend with NDJSON streaming
//! - Optional JSON-schema constrained decoding (`format`)
//! - Retry with exponential backoff for transient failures

pub mod backend;
pub mod prompt;

pub use backend::{
    FinishReason, GenerateOptions, GenerationResult, LlmBackend, OllamaBackend, RuntimeLlmConfig,
    StreamChunk, StreamStats,
};
pub use prompt::{Message, Role};

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("stream cancelled by receiver")]
    Cancelled,
}

impl LlmError {
    /// Transient failures are worth one retry
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Network(_) | LlmError::Timeout)
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for quarry_core::Error {
    fn from(err: LlmError) -> Self {
        let transient = err.is_transient();
        quarry_core::Error::DependencyUnavailable {
            dependency: "llm",
            message: err.to_string(),
            transient,
        }
    }
}
