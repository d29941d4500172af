#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod agents;
pub mod blocks;
pub mod bus;
pub mod context;
pub mod pool;
pub mod sequencer;
pub mod trace;
pub mod workbench;
