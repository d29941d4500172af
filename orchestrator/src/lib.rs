#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod clarification;
pub mod events;
pub mod pipeline;
pub mod report;

pub use events::{SessionStreams, WorkflowEvent, WorkflowStatus};
pub use pipeline::{PipelineOrchestrator, WorkflowOptions};
pub use report::WorkflowReport;
