use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct RefineRequest {
    pub task: String,
    #[serde(default)]
    pub req_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefineResponse {
    pub rounds: usize,
    pub accepted: bool,
    pub decision: String,
    /// CoT-stripped result text: the last FINAL_ANSWER, else the last
    /// DECISION. Never contains THOUGHTS or CRITIQUE blocks.
    pub result: String,
}

/// Single-requirement reflective refinement through the
/// planner/solver/verifier loop.
pub async fn refine_requirement(
    State(state): State<ApiState>,
    Json(request): Json<RefineRequest>,
) -> Result<Json<RefineResponse>, ApiError> {
    if request.task.trim().is_empty() {
        return Err(ApiError::ValidationError("task must not be empty".into()));
    }

    let outcome = state
        .sequencer
        .run_with_reflection(&request.task, request.req_id, request.session_id)
        .await?;

    Ok(Json(RefineResponse {
        rounds: outcome.rounds,
        accepted: outcome.accepted,
        decision: outcome.decision,
        result: outcome.ui_payload,
    }))
}
