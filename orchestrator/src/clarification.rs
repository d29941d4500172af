use std::sync::Arc;
use std::time::Duration;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::clarification_question::ClarificationQuestion},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{SessionStreams, WorkflowEvent};

/// Hard ceiling for waiting on a human answer.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Outcome of a clarification round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationOutcome {
    Answered(String),
    /// Nobody answered in time; the workflow proceeds with defaults.
    TimedOut,
    Canceled,
}

/// Asks the user one question over the session stream and polls the stored
/// record for the answer. One outstanding question per session.
pub async fn ask_and_wait(
    db: &Arc<SurrealDbClient>,
    streams: &Arc<SessionStreams>,
    session_id: &str,
    question: &str,
    suggestions: Vec<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ClarificationOutcome, AppError> {
    let record = ClarificationQuestion::new(
        session_id.to_string(),
        question.to_string(),
        suggestions.clone(),
    );
    let question_id = record.id.clone();
    db.upsert_item(record).await?;

    streams
        .emit(
            session_id,
            WorkflowEvent::ClarificationQuestion {
                question_id,
                session_id: session_id.to_string(),
                question: question.to_string(),
                suggestions,
            },
        )
        .await;

    info!(session_id, "waiting for clarification answer");
    let deadline = tokio::time::Instant::now() + timeout.min(ANSWER_TIMEOUT);

    loop {
        if cancel.is_cancelled() {
            return Ok(ClarificationOutcome::Canceled);
        }
        if let Some(answer) = ClarificationQuestion::fetch_answer(session_id, db).await? {
            info!(session_id, "clarification answered");
            return Ok(ClarificationOutcome::Answered(answer));
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(session_id, "clarification timed out; continuing with defaults");
            return Ok(ClarificationOutcome::TimedOut);
        }
        tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
    }
}
