use axum::{http::StatusCode, response::IntoResponse};

pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
