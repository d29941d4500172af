use axum::{extract::State, Json};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use mining_pipeline::{ChunkingOptions, FileOrText};
use orchestrator::pipeline::WorkflowOptions;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, TryFromMultipart)]
pub struct UploadParams {
    #[form_data(limit = "10000000")]
    #[form_data(default)]
    pub files: Vec<FieldData<NamedTempFile>>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub neighbor_refs: Option<bool>,
    pub model: Option<String>,
    pub guided: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub session_id: String,
    pub status: String,
}

/// Accepts uploaded documents and launches the full pipeline in the
/// background. Progress streams over `/api/workflow/stream/{session_id}`.
pub async fn mining_upload(
    State(state): State<ApiState>,
    TypedMultipart(params): TypedMultipart<UploadParams>,
) -> Result<Json<UploadResponse>, ApiError> {
    if params.files.is_empty() {
        return Err(ApiError::ValidationError("no files uploaded".into()));
    }

    let mut inputs = Vec::with_capacity(params.files.len());
    for (i, field) in params.files.iter().enumerate() {
        let filename = field
            .metadata
            .file_name
            .clone()
            .unwrap_or_else(|| format!("upload_{i}"));
        let content_type = field.metadata.content_type.clone().unwrap_or_default();
        let data = tokio::fs::read(field.contents.path())
            .await
            .map_err(|e| ApiError::InternalError(format!("failed to read upload: {e}")))?;
        inputs.push(FileOrText::File {
            filename,
            data,
            content_type,
        });
    }

    let chunking = match (params.chunk_size, params.chunk_overlap) {
        (None, None) => None,
        (size, overlap) => {
            let defaults = ChunkingOptions {
                min_tokens: state.config.chunk_tokens_min,
                max_tokens: state.config.chunk_tokens_max,
                overlap_tokens: state.config.chunk_overlap_tokens,
            };
            Some(ChunkingOptions {
                max_tokens: size.unwrap_or(defaults.max_tokens),
                overlap_tokens: overlap.unwrap_or(defaults.overlap_tokens),
                min_tokens: defaults.min_tokens.min(size.unwrap_or(defaults.max_tokens)),
            })
        }
    };

    let options = WorkflowOptions {
        chunking,
        neighbor_refs: params.neighbor_refs.unwrap_or(false),
        model: params.model,
        use_llm_kg: true,
        guided: params.guided.unwrap_or(false),
        validation_threshold: Some(state.config.verdict_threshold),
        ..WorkflowOptions::default()
    };

    let session_id = Uuid::new_v4().to_string();
    state.streams.register(&session_id).await;

    let cancel = CancellationToken::new();
    state
        .cancellations
        .lock()
        .await
        .insert(session_id.clone(), cancel.clone());

    info!(session_id = %session_id, files = inputs.len(), "workflow started");
    let orchestrator = state.orchestrator;
    let cancellations = state.cancellations;
    let task_session = session_id.clone();
    tokio::spawn(async move {
        if let Err(err) = orchestrator
            .run(&task_session, inputs, options, cancel)
            .await
        {
            error!(session_id = %task_session, error = %err, "workflow failed");
        }
        cancellations.lock().await.remove(&task_session);
    });

    Ok(Json(UploadResponse {
        session_id,
        status: "started".to_string(),
    }))
}
