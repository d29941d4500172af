use axum::{
    extract::{Query, State},
    Json,
};
use common::model::Requirement;
use kg_pipeline::{KgBuildOptions, KgBuildResult, NeighborDirection, NeighborEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize, Default)]
pub struct KgBuildRequestOptions {
    #[serde(default)]
    pub use_llm: bool,
    /// Persistence target; any value other than `none` lands in the vector
    /// store.
    #[serde(default)]
    pub persist: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KgBuildRequest {
    pub items: Vec<Requirement>,
    #[serde(default)]
    pub options: KgBuildRequestOptions,
}

pub async fn kg_build(
    State(state): State<ApiState>,
    Json(request): Json<KgBuildRequest>,
) -> Result<Json<KgBuildResult>, ApiError> {
    if request.items.is_empty() {
        return Err(ApiError::ValidationError("items must not be empty".into()));
    }

    let persist = request
        .options
        .persist
        .as_deref()
        .map_or(true, |p| !p.eq_ignore_ascii_case("none"));
    let options = KgBuildOptions {
        use_llm: request.options.use_llm,
        llm_fallback: true,
        dedupe: true,
        persist,
        model: request.options.model,
    };

    let result = state.kg_builder.build(&request.items, &options).await;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct NodeSearchParams {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub node_type: Option<String>,
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct NodeSearchRow {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

pub async fn kg_search_nodes(
    State(state): State<ApiState>,
    Query(params): Query<NodeSearchParams>,
) -> Result<Json<Vec<NodeSearchRow>>, ApiError> {
    if params.query.trim().is_empty() {
        return Err(ApiError::ValidationError("query must not be empty".into()));
    }

    let hits = state
        .graph_search
        .search_nodes(
            &params.query,
            params.top_k.clamp(1, 100),
            params.node_type.as_deref(),
        )
        .await?;

    Ok(Json(
        hits.into_iter()
            .map(|hit| NodeSearchRow {
                id: hit.id,
                score: hit.score,
                payload: hit.payload,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct NeighborParams {
    pub node_id: String,
    #[serde(default = "default_dir")]
    pub dir: String,
    #[serde(default)]
    pub rel: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_dir() -> String {
    "both".to_string()
}

fn default_limit() -> usize {
    25
}

pub async fn kg_neighbors(
    State(state): State<ApiState>,
    Query(params): Query<NeighborParams>,
) -> Result<Json<Vec<NeighborEntry>>, ApiError> {
    if params.node_id.trim().is_empty() {
        return Err(ApiError::ValidationError("node_id must not be empty".into()));
    }

    let entries = state
        .graph_search
        .neighbors(
            &params.node_id,
            NeighborDirection::from_loose(&params.dir),
            params.rel.as_deref(),
            params.limit.clamp(1, 200),
        )
        .await?;

    Ok(Json(entries))
}
