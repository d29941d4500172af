#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunking;
pub mod extraction;
pub mod miner;
pub mod schema;

pub use chunking::ChunkingOptions;
pub use extraction::{DefaultDocumentParser, DocumentParser, FileOrText};
pub use miner::{MiningAgent, MiningOptions};
