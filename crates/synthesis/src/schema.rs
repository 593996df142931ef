//! Structured answer schema
//!
//! The model is asked for a single JSON object; the same schema drives
//! constrained decoding (when the backend supports it) and the
//! parse-then-validate step on completion. Citations are hydrated from the
//! context set, never from model-provided metadata.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use quarry_core::{Citation, RerankedContext};

use crate::SynthesisError;

/// Model output shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnswer {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<LlmCitation>,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub reason: String,
}

/// One model citation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCitation {
    pub chunk_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Short span quoted from the chunk
    #[serde(default)]
    pub quote: Option<String>,
}

/// JSON schema for the model output, passed to the backend for constrained
/// decoding and used to validate the completed text
pub fn answer_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "answer": { "type": "string" },
            "citations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "chunk_id": { "type": "string" },
                        "reason": { "type": "string" },
                        "quote": { "type": "string" }
                    },
                    "required": ["chunk_id"]
                }
            },
            "fallback": { "type": "boolean" },
            "reason": { "type": "string" }
        },
        "required": ["answer", "citations", "fallback", "reason"]
    })
}

static COMPILED_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::compile(&answer_schema()).expect("answer schema is valid JSON Schema")
});

/// Parse the completed model text into an `LlmAnswer`.
///
/// Without constrained decoding models wrap JSON in prose or code fences, so
/// parsing starts at the outermost object.
pub fn parse_answer(text: &str) -> Result<LlmAnswer, SynthesisError> {
    let json_text = extract_json_object(text)
        .ok_or_else(|| SynthesisError::Parse("no JSON object in model output".to_string()))?;

    let value: serde_json::Value = serde_json::from_str(json_text)
        .map_err(|e| SynthesisError::Parse(e.to_string()))?;

    if let Err(errors) = COMPILED_SCHEMA.validate(&value) {
        let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(SynthesisError::Schema(detail.join("; ")));
    }

    serde_json::from_value(value).map_err(|e| SynthesisError::Parse(e.to_string()))
}

/// Slice from the first `{` to the last `}`
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Outcome of citation validation
#[derive(Debug)]
pub enum CitationCheck {
    /// Every citation resolves to a supplied context
    Valid(Vec<Citation>),
    /// A citation names a chunk outside the context set
    Ungrounded,
    /// The model cited nothing
    NoCitations,
}

/// Validate the model's citations against the context set and hydrate them
/// with metadata from the matching contexts.
pub fn hydrate_citations(answer: &LlmAnswer, contexts: &[RerankedContext]) -> CitationCheck {
    if answer.citations.is_empty() {
        return CitationCheck::NoCitations;
    }

    let mut citations = Vec::with_capacity(answer.citations.len());
    for cited in &answer.citations {
        let Some(ctx) = contexts.iter().find(|c| c.chunk_id == cited.chunk_id) else {
            return CitationCheck::Ungrounded;
        };
        citations.push(Citation {
            chunk_id: ctx.chunk_id.clone(),
            quote: cited.quote.clone(),
            url: ctx.url.clone(),
            title: ctx.title.clone(),
            score: ctx.score,
            document_version: ctx.document_version,
        });
    }

    CitationCheck::Valid(citations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn context(chunk_id: &str) -> RerankedContext {
        RerankedContext {
            chunk_id: chunk_id.to_string(),
            article_id: "a1".to_string(),
            score: 0.9,
            rank: 1,
            text: "text".to_string(),
            title: Some("title".to_string()),
            url: Some("http://example.com".to_string()),
            published_at: None,
            document_version: 3,
        }
    }

    #[test]
    fn test_parse_plain_json() {
        let text = r#"{"answer":"TPUs accelerate tensors [C1]","citations":[{"chunk_id":"C1"}],"fallback":false,"reason":""}"#;
        let parsed = parse_answer(text).unwrap();
        assert!(!parsed.fallback);
        assert_eq!(parsed.citations[0].chunk_id, "C1");
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "Here is the result:\n```json\n{\"answer\":\"x\",\"citations\":[],\"fallback\":true,\"reason\":\"nothing relevant\"}\n```";
        let parsed = parse_answer(text).unwrap();
        assert!(parsed.fallback);
        assert_eq!(parsed.reason, "nothing relevant");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_answer("I could not find anything.").is_err());
        assert!(parse_answer("").is_err());
    }

    #[test]
    fn test_schema_rejects_wrong_types() {
        let text = r#"{"answer": 42, "citations": [], "fallback": false, "reason": ""}"#;
        assert!(matches!(
            parse_answer(text),
            Err(SynthesisError::Schema(_))
        ));
    }

    #[test]
    fn test_hydration_fills_metadata_from_context() {
        let answer = LlmAnswer {
            answer: "grounded".to_string(),
            citations: vec![LlmCitation {
                chunk_id: "c1".to_string(),
                reason: None,
                quote: Some("a quote".to_string()),
            }],
            fallback: false,
            reason: String::new(),
        };
        let contexts = vec![context("c1")];

        match hydrate_citations(&answer, &contexts) {
            CitationCheck::Valid(citations) => {
                assert_eq!(citations[0].url.as_deref(), Some("http://example.com"));
                assert_eq!(citations[0].document_version, 3);
                assert_eq!(citations[0].quote.as_deref(), Some("a quote"));
            }
            other => panic!("expected valid citations, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_chunk_is_ungrounded() {
        let answer = LlmAnswer {
            answer: "x".to_string(),
            citations: vec![LlmCitation {
                chunk_id: "UNKNOWN".to_string(),
                reason: None,
                quote: None,
            }],
            fallback: false,
            reason: String::new(),
        };
        assert!(matches!(
            hydrate_citations(&answer, &[context("c1")]),
            CitationCheck::Ungrounded
        ));
    }

    #[test]
    fn test_empty_citations_is_no_citations() {
        let answer = LlmAnswer {
            answer: "x".to_string(),
            citations: vec![],
            fallback: false,
            reason: String::new(),
        };
        assert!(matches!(
            hydrate_citations(&answer, &[context("c1")]),
            CitationCheck::NoCitations
        ));
    }

    proptest! {
        /// Hydrated citations are always a subset of the context set
        #[test]
        fn test_citation_containment(
            context_ids in proptest::collection::vec("[a-z][a-z0-9]{0,6}", 1..8),
            cited_ids in proptest::collection::vec("[a-z][a-z0-9]{0,6}", 1..8),
        ) {
            let contexts: Vec<RerankedContext> =
                context_ids.iter().map(|id| context(id)).collect();
            let answer = LlmAnswer {
                answer: "x".to_string(),
                citations: cited_ids
                    .iter()
                    .map(|id| LlmCitation {
                        chunk_id: id.clone(),
                        reason: None,
                        quote: None,
                    })
                    .collect(),
                fallback: false,
                reason: String::new(),
            };

            match hydrate_citations(&answer, &contexts) {
                CitationCheck::Valid(citations) => {
                    // Every hydrated citation must reference a context
                    for citation in &citations {
                        prop_assert!(context_ids.contains(&citation.chunk_id));
                    }
                }
                CitationCheck::Ungrounded => {
                    // At least one cited id must be outside the context set
                    prop_assert!(cited_ids.iter().any(|id| !context_ids.contains(id)));
                }
                CitationCheck::NoCitations => unreachable!("citations are non-empty"),
            }
        }
    }
}
