use std::{convert::Infallible, time::Duration};

use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use common::storage::types::clarification_question::ClarificationQuestion;
use futures::StreamExt;
use orchestrator::{WorkflowEvent, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{api_state::ApiState, error::ApiError};

fn to_sse_event(event: &WorkflowEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_type()).data(data)
}

/// True when the stream should end after delivering this event.
fn is_terminal(event: &WorkflowEvent) -> bool {
    matches!(
        event,
        WorkflowEvent::WorkflowResult { .. }
            | WorkflowEvent::WorkflowStatus {
                status: WorkflowStatus::Failed,
                ..
            }
    )
}

/// Per-session SSE stream. Critical events come from the bounded queue and
/// are never dropped; agent chatter joins from the lossy broadcast feed.
pub async fn workflow_stream(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(mut critical_rx) = state.streams.take_critical_rx(&session_id).await else {
        return Err(ApiError::NotFound(format!(
            "no open stream for session {session_id}"
        )));
    };
    let mut lossy_rx = state
        .streams
        .subscribe_lossy(&session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown session {session_id}")))?;

    // Two sources, one wire: critical events mark themselves so the merged
    // stream knows when to finish.
    let critical_stream = stream! {
        while let Some(event) = critical_rx.recv().await {
            yield (true, event);
        }
    };
    let lossy_stream = stream! {
        loop {
            match lossy_rx.recv().await {
                Ok(event) => yield (false, event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Slow client: older agent messages are gone.
                    debug!(missed, "agent message stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    let mut merged = futures::stream::select(critical_stream.boxed(), lossy_stream.boxed());

    let event_stream = stream! {
        while let Some((critical, event)) = merged.next().await {
            let terminal = critical && is_terminal(&event);
            yield Ok::<Event, Infallible>(to_sse_event(&event));
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ClarificationAnswer {
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct ClarificationAccepted {
    pub status: String,
}

/// Accepts the user's answer to the session's outstanding clarification
/// question.
pub async fn submit_clarification(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(body): Json<ClarificationAnswer>,
) -> Result<Json<ClarificationAccepted>, ApiError> {
    if body.answer.trim().is_empty() {
        return Err(ApiError::ValidationError("answer must not be empty".into()));
    }
    ClarificationQuestion::submit_answer(&session_id, body.answer, &state.db).await?;
    Ok(Json(ClarificationAccepted {
        status: "accepted".to_string(),
    }))
}

/// Cancels a running workflow; in-flight LLM calls complete and are
/// discarded at the next stage boundary.
pub async fn cancel_workflow(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancellations = state.cancellations.lock().await;
    let Some(token) = cancellations.get(&session_id) else {
        return Err(ApiError::NotFound(format!(
            "no running workflow for session {session_id}"
        )));
    };
    token.cancel();
    Ok((StatusCode::OK, Json(json!({ "status": "canceling" }))))
}
