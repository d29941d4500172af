#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use routes::{
    evaluate::evaluate_single,
    kg::{kg_build, kg_neighbors, kg_search_nodes},
    liveness::live,
    mining::mining_upload,
    readiness::ready,
    refine::refine_requirement,
    validate::{validate_batch, validate_batch_stream, validate_suggest},
    workflow::{cancel_workflow, submit_clarification, workflow_stream},
};

pub mod api_state;
pub mod error;
mod routes;

const UPLOAD_BODY_LIMIT: usize = 50 * 1024 * 1024;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(_app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let api = Router::new()
        .route("/api/v1/evaluate/single", post(evaluate_single))
        .route("/api/v1/validate/batch", post(validate_batch))
        .route("/api/v1/validate/batch/stream", post(validate_batch_stream))
        .route("/api/v1/validate/suggest", post(validate_suggest))
        .route("/api/v1/refine", post(refine_requirement))
        .route("/api/kg/build", post(kg_build))
        .route("/api/kg/search/nodes", get(kg_search_nodes))
        .route("/api/kg/neighbors", get(kg_neighbors))
        .route(
            "/api/mining/upload",
            post(mining_upload).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/workflow/stream/{session_id}", get(workflow_stream))
        .route(
            "/api/workflow/clarification/{session_id}",
            post(submit_clarification),
        )
        .route("/api/workflow/cancel/{session_id}", post(cancel_workflow));

    public.merge(api)
}
