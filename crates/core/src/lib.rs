//! Core types for the Quarry RAG orchestrator
//!
//! This crate provides the types shared across all other crates:
//! - Articles, chunks and document versions
//! - Retrieval candidates, fused results and reranked contexts
//! - Answers, citations and streaming answer events
//! - Background job types
//! - The error taxonomy

pub mod answer;
pub mod article;
pub mod chunk;
pub mod error;
pub mod job;
pub mod retrieval;

pub use answer::{AnswerEvent, AnswerResponse, Citation, DebugMeta, FallbackReason};
pub use article::Article;
pub use chunk::{ChunkPiece, DocumentVersion, NO_VERSION};
pub use error::{Error, Result};
pub use job::{JobStatus, JobType, RagJob};
pub use retrieval::{Channel, FusedResult, RerankedContext, RetrievalCandidate};
