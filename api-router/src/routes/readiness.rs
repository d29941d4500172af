use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::api_state::ApiState;

pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    match state.db.client.health().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
