//! Chunk types
//!
//! A chunk is the unit of retrieval: a contiguous passage of an article,
//! tagged with the document version it was indexed under. For a given
//! article exactly one version is current; older versions are tombstoned and
//! reclaimed out-of-band.

use serde::{Deserialize, Serialize};

/// Monotonically increasing per-article version counter
pub type DocumentVersion = i64;

/// Registry value meaning "no current version" (article deleted or never indexed)
pub const NO_VERSION: DocumentVersion = 0;

/// A chunk produced by the chunker, before embedding and id assignment.
///
/// Chunking is pure: the same body always yields the same pieces, which keeps
/// re-embedding stable across versions. Chunk ids (UUIDs) are minted by the
/// indexer at upsert time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPiece {
    /// Position of this piece within the article, starting at 0
    pub ordinal: usize,
    pub text: String,
    /// Estimated token count of `text`
    pub token_count: usize,
}
