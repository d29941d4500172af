use common::model::Requirement;
use kg_pipeline::{DuplicateReport, KgBuildStats};
use serde::{Deserialize, Serialize};
use validation_pipeline::{BatchResult, BatchRewriteResult};

/// Final aggregate of one workflow run; serialized into the
/// `workflow_result` stream event. Contains no trace internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub success: bool,
    pub workflow_status: String,
    pub requirements: Vec<Requirement>,
    pub kg_stats: KgBuildStats,
    pub validation: BatchResult,
    pub rewrites: BatchRewriteResult,
    pub duplicates: Option<DuplicateReport>,
    pub summary: WorkflowSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowSummary {
    pub total_requirements: usize,
    pub kg_nodes: usize,
    pub kg_edges: usize,
    pub validation_passed: usize,
    pub validation_failed: usize,
    pub rewritten: usize,
    pub duplicate_groups: usize,
}

impl WorkflowReport {
    pub fn summarize(
        requirements: Vec<Requirement>,
        kg_stats: KgBuildStats,
        validation: BatchResult,
        rewrites: BatchRewriteResult,
        duplicates: Option<DuplicateReport>,
    ) -> Self {
        let summary = WorkflowSummary {
            total_requirements: requirements.len(),
            kg_nodes: kg_stats.nodes,
            kg_edges: kg_stats.edges,
            validation_passed: validation.passed,
            validation_failed: validation.failed,
            rewritten: rewrites.rewritten,
            duplicate_groups: duplicates.as_ref().map_or(0, |d| d.groups.len()),
        };
        Self {
            success: true,
            workflow_status: "completed".to_string(),
            requirements,
            kg_stats,
            validation,
            rewrites,
            duplicates,
            summary,
        }
    }
}
