use std::collections::BTreeMap;

use async_stream::stream;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::storage::types::evaluation::CriterionEvaluation;
use serde::{Deserialize, Serialize};
use validation_pipeline::{RequirementScorer, SuggestionAtom, ValidationItem};

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ValidateBatchRequest {
    pub items: Vec<String>,
    #[serde(default, rename = "includeSuggestions")]
    pub include_suggestions: bool,
    #[serde(default)]
    pub criteria_keys: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ValidateBatchRow {
    pub id: String,
    #[serde(rename = "originalText")]
    pub original_text: String,
    pub score: f32,
    pub verdict: String,
    pub evaluation: Vec<CriterionEvaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<SuggestionAtom>>,
}

fn to_items(texts: &[String]) -> Vec<ValidationItem> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| ValidationItem {
            req_id: format!("item-{i}"),
            text: text.clone(),
            tag: None,
        })
        .collect()
}

/// Scores an array of requirement texts. Items that error out come back with
/// `verdict = "error"` inside a 200 response.
pub async fn validate_batch(
    State(state): State<ApiState>,
    Json(request): Json<ValidateBatchRequest>,
) -> Result<Json<Vec<ValidateBatchRow>>, ApiError> {
    if request.items.is_empty() {
        return Err(ApiError::ValidationError("items must not be empty".into()));
    }

    let batch = state
        .validation
        .validate(to_items(&request.items), request.criteria_keys.clone(), None, None)
        .await;

    let mut rows = Vec::with_capacity(batch.results.len());
    for result in batch.results {
        let suggestions = if request.include_suggestions && result.verdict == "fail" {
            Some(state.suggestions.suggest(&result.title).await?)
        } else {
            None
        };
        rows.push(ValidateBatchRow {
            id: result.req_id,
            original_text: result.title,
            score: result.score,
            verdict: result.verdict,
            evaluation: result.evaluation,
            error: result.error,
            suggestions,
        });
    }

    Ok(Json(rows))
}

/// Same contract as the batch endpoint, but results arrive as NDJSON, one
/// object per line as each item finishes scoring.
pub async fn validate_batch_stream(
    State(state): State<ApiState>,
    Json(request): Json<ValidateBatchRequest>,
) -> Result<Response, ApiError> {
    if request.items.is_empty() {
        return Err(ApiError::ValidationError("items must not be empty".into()));
    }

    let scorer = state.scorer;
    let threshold = state.config.verdict_threshold;
    let criteria_keys = request.criteria_keys.clone();
    let items = request.items;

    let body_stream = stream! {
        for (i, text) in items.into_iter().enumerate() {
            let row = match scorer.score(&text, criteria_keys.as_deref(), threshold).await {
                Ok(outcome) => ValidateBatchRow {
                    id: format!("item-{i}"),
                    original_text: text,
                    score: outcome.score,
                    verdict: outcome.verdict,
                    evaluation: outcome.evaluation,
                    error: None,
                    suggestions: None,
                },
                Err(err) => ValidateBatchRow {
                    id: format!("item-{i}"),
                    original_text: text,
                    score: 0.0,
                    verdict: "error".to_string(),
                    evaluation: Vec::new(),
                    error: Some(err.to_string()),
                    suggestions: None,
                },
            };
            let mut line = serde_json::to_string(&row).unwrap_or_else(|_| "{}".to_string());
            line.push('\n');
            yield Ok::<_, std::convert::Infallible>(line);
        }
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(response.into_response())
}

#[derive(Debug, Deserialize)]
pub struct SuggestRequest {
    pub items: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SuggestEntry {
    pub suggestions: Vec<SuggestionAtom>,
}

#[derive(Debug, Serialize)]
pub struct SuggestResponse {
    pub items: BTreeMap<usize, SuggestEntry>,
}

pub async fn validate_suggest(
    State(state): State<ApiState>,
    Json(request): Json<SuggestRequest>,
) -> Result<Json<SuggestResponse>, ApiError> {
    if request.items.is_empty() {
        return Err(ApiError::ValidationError("items must not be empty".into()));
    }

    let mut items = BTreeMap::new();
    for (i, text) in request.items.iter().enumerate() {
        let suggestions = state.suggestions.suggest(text).await?;
        items.insert(i, SuggestEntry { suggestions });
    }

    Ok(Json(SuggestResponse { items }))
}
