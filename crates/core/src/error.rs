//! Error taxonomy
//!
//! Every crate-local error (retrieval, LLM, persistence, synthesis) converges
//! into this enum at the orchestration boundary so HTTP mapping and fallback
//! policy live in one place.

use thiserror::Error;

/// Top-level error for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or empty input; never retried
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A downstream capability (embedder, LLM, search, reranker) failed
    #[error("{dependency} unavailable: {message}")]
    DependencyUnavailable {
        dependency: &'static str,
        message: String,
        /// Transient failures are retried once with backoff
        transient: bool,
    },

    /// Both retrieval channels failed
    #[error("retrieval failed: {0}")]
    RetrievalFailed(String),

    /// Citation validation failed after generation
    #[error("answer not grounded: {0}")]
    Ungrounded(String),

    /// Request or component deadline exceeded
    #[error("deadline exceeded")]
    Timeout,

    /// Concurrent write conflict (e.g. simultaneous upsert of one article)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invariant violation (e.g. embedding dimension mismatch)
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient errors are eligible for a single retry with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Error::DependencyUnavailable { transient, .. } => *transient,
            Error::Timeout => false,
            _ => false,
        }
    }

    /// Short machine-readable code included in user-visible failures
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::DependencyUnavailable { .. } => "dependency_unavailable",
            Error::RetrievalFailed(_) => "retrieval_failed",
            Error::Ungrounded(_) => "ungrounded",
            Error::Timeout => "timeout",
            Error::Conflict(_) => "conflict",
            Error::Internal(_) => "internal",
        }
    }

    /// Shorthand for a transient dependency failure
    pub fn transient(dependency: &'static str, message: impl Into<String>) -> Self {
        Error::DependencyUnavailable {
            dependency,
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a permanent dependency failure
    pub fn permanent(dependency: &'static str, message: impl Into<String>) -> Self {
        Error::DependencyUnavailable {
            dependency,
            message: message.into(),
            transient: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("embedder", "connection reset").is_transient());
        assert!(!Error::permanent("embedder", "bad request").is_transient());
        assert!(!Error::InvalidArgument("empty query".into()).is_transient());
        assert!(!Error::Timeout.is_transient());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(Error::Timeout.reason_code(), "timeout");
        assert_eq!(
            Error::Conflict("concurrent upsert".into()).reason_code(),
            "conflict"
        );
    }
}
