//! Answer payloads and streaming events

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chunk::DocumentVersion;
use crate::retrieval::RerankedContext;

/// A claim that part of the answer is grounded in a specific chunk.
///
/// Every `chunk_id` here must appear in the context set supplied to the LLM
/// for the same request; violations force a fallback response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    /// Short span quoted from the chunk, when the model provided one
    pub quote: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub score: f32,
    pub document_version: DocumentVersion,
}

/// Why the system declined to answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoContext,
    UngroundedCitation,
    NoCitations,
    LlmUnavailable,
    /// A retrieval-side dependency failed but the request could still be
    /// answered with a degraded response
    DependencyUnavailable,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoContext => "no_context",
            Self::UngroundedCitation => "ungrounded_citation",
            Self::NoCitations => "no_citations",
            Self::LlmUnavailable => "llm_unavailable",
            Self::DependencyUnavailable => "dependency_unavailable",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped debug metadata surfaced to clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugMeta {
    /// UUID minted when the context set is fixed
    pub retrieval_set_id: String,
    pub prompt_version: String,
    /// Set when reranking degraded and fused order was used as-is
    #[serde(default)]
    pub rerank_skipped: bool,
}

/// Final answer payload.
///
/// Invariants: `fallback == true` implies empty answer and a non-empty
/// reason; `fallback == false` implies non-empty citations, each referencing
/// a chunk from `contexts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub contexts: Vec<RerankedContext>,
    pub fallback: bool,
    pub reason: Option<String>,
    pub debug: DebugMeta,
}

impl AnswerResponse {
    /// Build a fallback response; the answer is always empty
    pub fn fallback(reason: FallbackReason, contexts: Vec<RerankedContext>, debug: DebugMeta) -> Self {
        Self {
            answer: String::new(),
            citations: Vec::new(),
            contexts,
            fallback: true,
            reason: Some(reason.as_str().to_string()),
            debug,
        }
    }

    /// Check the fallback/citation invariants (used by tests and the
    /// synthesis pipeline's final assertion)
    pub fn is_well_formed(&self) -> bool {
        if self.fallback {
            self.answer.is_empty() && self.reason.as_deref().map_or(false, |r| !r.is_empty())
        } else {
            !self.citations.is_empty()
                && self.citations.iter().all(|c| {
                    self.contexts.iter().any(|ctx| ctx.chunk_id == c.chunk_id)
                })
        }
    }
}

/// One event of a streamed answer.
///
/// Ordering per request: exactly one `Meta` first, zero or more `Delta`,
/// then exactly one terminal `Done` or `Fallback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnswerEvent {
    Meta {
        contexts: Vec<RerankedContext>,
        debug: DebugMeta,
    },
    Delta {
        text: String,
    },
    Done {
        response: AnswerResponse,
    },
    Fallback {
        reason: FallbackReason,
        /// Partial answer text kept for diagnostics; may be empty
        partial: String,
        debug: DebugMeta,
    },
}

impl AnswerEvent {
    /// SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Delta { .. } => "delta",
            Self::Done { .. } => "done",
            Self::Fallback { .. } => "fallback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Fallback { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str) -> RerankedContext {
        RerankedContext {
            chunk_id: id.to_string(),
            article_id: "a1".to_string(),
            score: 0.9,
            rank: 1,
            text: "text".to_string(),
            title: None,
            url: None,
            published_at: None,
            document_version: 1,
        }
    }

    #[test]
    fn test_fallback_response_is_well_formed() {
        let resp = AnswerResponse::fallback(FallbackReason::NoContext, vec![], DebugMeta::default());
        assert!(resp.fallback);
        assert!(resp.answer.is_empty());
        assert!(resp.is_well_formed());
    }

    #[test]
    fn test_citation_containment() {
        let mut resp = AnswerResponse {
            answer: "grounded".to_string(),
            citations: vec![Citation {
                chunk_id: "c1".to_string(),
                quote: None,
                url: None,
                title: None,
                score: 0.8,
                document_version: 1,
            }],
            contexts: vec![context("c1")],
            fallback: false,
            reason: None,
            debug: DebugMeta::default(),
        };
        assert!(resp.is_well_formed());

        resp.citations[0].chunk_id = "unknown".to_string();
        assert!(!resp.is_well_formed());
    }

    #[test]
    fn test_event_kinds() {
        let ev = AnswerEvent::Delta {
            text: "hi".to_string(),
        };
        assert_eq!(ev.kind(), "delta");
        assert!(!ev.is_terminal());
        let ev = AnswerEvent::Fallback {
            reason: FallbackReason::NoCitations,
            partial: String::new(),
            debug: DebugMeta::default(),
        };
        assert!(ev.is_terminal());
    }

    #[test]
    fn test_event_json_tagging() {
        let ev = AnswerEvent::Delta {
            text: "x".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "delta");
        assert_eq!(json["text"], "x");
    }
}
