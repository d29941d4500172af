use axum::{extract::State, Json};
use common::storage::types::evaluation::CriterionEvaluation;
use serde::{Deserialize, Serialize};
use validation_pipeline::RequirementScorer;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct EvaluateSingleRequest {
    pub text: String,
    #[serde(default)]
    pub criteria_keys: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateSingleResponse {
    pub score: f32,
    pub verdict: String,
    pub evaluation: Vec<CriterionEvaluation>,
}

pub async fn evaluate_single(
    State(state): State<ApiState>,
    Json(request): Json<EvaluateSingleRequest>,
) -> Result<Json<EvaluateSingleResponse>, ApiError> {
    if request.text.trim().is_empty() {
        return Err(ApiError::ValidationError("text must not be empty".into()));
    }

    let outcome = state
        .scorer
        .score(
            &request.text,
            request.criteria_keys.as_deref(),
            state.config.verdict_threshold,
        )
        .await?;

    Ok(Json(EvaluateSingleResponse {
        score: outcome.score,
        verdict: outcome.verdict,
        evaluation: outcome.evaluation,
    }))
}
