#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod builder;
pub mod duplicates;
pub mod graph;
pub mod lexicon;
pub mod search;

pub use builder::{KgBuildOptions, KgBuildResult, KgBuildStats, KgBuilder};
pub use duplicates::{
    DuplicateCandidate, DuplicateDetector, DuplicateGroup, DuplicateReport, DuplicateStats,
};
pub use graph::{norm_key, KgEdge, KgNode, NodeType, Relation};
pub use lexicon::Lexicon;
pub use search::{GraphSearch, NeighborDirection, NeighborEntry};
