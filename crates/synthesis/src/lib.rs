//! Answer synthesis
//!
//! Composes the query planner, hybrid retriever, reranker and LLM into the
//! answer pipeline: a bounded-context XML prompt, structured JSON output with
//! schema validation, citation validation against the supplied context set,
//! and a streamed event sequence (`meta`, `delta`*, `done` | `fallback`).

pub mod pipeline;
pub mod prompt;
pub mod schema;

pub use pipeline::{AnswerPipeline, AnswerRequest, RetrieveOutput, SynthesisSettings};
pub use prompt::{build_messages, PromptBudgets};
pub use schema::{answer_schema, hydrate_citations, parse_answer, CitationCheck, LlmAnswer};

use thiserror::Error;

/// Synthesis errors. Most are absorbed into fallback responses; only
/// pre-flight validation and deadline errors escape to the HTTP layer.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to parse model output: {0}")]
    Parse(String),

    #[error("model output failed schema validation: {0}")]
    Schema(String),

    #[error("deadline exceeded")]
    Timeout,
}

impl From<SynthesisError> for quarry_core::Error {
    fn from(err: SynthesisError) -> Self {
        match err {
            SynthesisError::InvalidArgument(m) => quarry_core::Error::InvalidArgument(m),
            SynthesisError::Timeout => quarry_core::Error::Timeout,
            other => quarry_core::Error::Internal(other.to_string()),
        }
    }
}
