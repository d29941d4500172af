pub mod chunk;
pub mod requirement;

pub use chunk::{BlockMeta, Chunk, ChunkPayload, EvidenceRef, RawBlock};
pub use requirement::{Requirement, RequirementPriority, RequirementTag};
