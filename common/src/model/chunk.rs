use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw text block produced by document extraction. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawBlock {
    pub text: String,
    pub meta: BlockMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockMeta {
    #[serde(rename = "sourceFile")]
    pub source_file: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub sha1: String,
    #[serde(rename = "pageNo", skip_serializing_if = "Option::is_none")]
    pub page_no: Option<u32>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Token-bounded slice of a raw block. Chunks sharing a `sha1` form a dense,
/// gap-free `chunk_index` sequence `0..n`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    #[serde(rename = "sourceFile")]
    pub source_file: String,
    pub sha1: String,
    #[serde(rename = "chunkIndex")]
    pub chunk_index: usize,
    #[serde(rename = "tokenLen")]
    pub token_len: usize,
    #[serde(rename = "pageNo", skip_serializing_if = "Option::is_none")]
    pub page_no: Option<u32>,
}

impl ChunkPayload {
    pub fn evidence_ref(&self) -> EvidenceRef {
        EvidenceRef {
            source_file: self.source_file.clone(),
            sha1: self.sha1.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// Provenance pointer into the chunk space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvidenceRef {
    #[serde(rename = "sourceFile")]
    pub source_file: String,
    pub sha1: String,
    #[serde(rename = "chunkIndex")]
    pub chunk_index: usize,
}
