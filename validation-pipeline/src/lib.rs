#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod cache;
pub mod delegator;
pub mod evaluation;
pub mod rewrite;
pub mod suggest;

pub use cache::{ArtifactCache, CacheScope};
pub use delegator::{BatchResult, ValidationDelegator, ValidationItem, ValidationResult};
pub use evaluation::{EvaluationOutcome, EvaluationService, RequirementScorer};
pub use rewrite::{BatchRewriteResult, FailedRequirement, RewriteDelegator, RewriteResult};
pub use suggest::{SuggestionAtom, SuggestionService};

use std::sync::Arc;

/// Sink for human-readable progress lines `(agent, message)` streamed to the
/// session channel.
pub type AgentMessageSink = Arc<dyn Fn(&str, &str) + Send + Sync>;
