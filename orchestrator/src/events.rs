use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, warn};

/// Bound for the never-dropped event queue; a slow client eventually blocks
/// the producer on these.
const CRITICAL_CAPACITY: usize = 64;
/// Bound for the lossy agent-message feed; lagging clients lose the oldest.
const LOSSY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

/// Events on the per-session stream, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStatus {
        status: WorkflowStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AgentMessage {
        agent: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowResult {
        result: serde_json::Value,
    },
    ClarificationQuestion {
        question_id: String,
        session_id: String,
        question: String,
        suggestions: Vec<String>,
    },
}

impl WorkflowEvent {
    pub fn agent_message(agent: &str, message: impl Into<String>) -> Self {
        WorkflowEvent::AgentMessage {
            agent: agent.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(status: WorkflowStatus) -> Self {
        WorkflowEvent::WorkflowStatus {
            status,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        WorkflowEvent::WorkflowStatus {
            status: WorkflowStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStatus { .. } => "workflow_status",
            WorkflowEvent::AgentMessage { .. } => "agent_message",
            WorkflowEvent::WorkflowResult { .. } => "workflow_result",
            WorkflowEvent::ClarificationQuestion { .. } => "clarification_question",
        }
    }

    /// Critical events must never be dropped, whatever the client does.
    pub fn is_critical(&self) -> bool {
        !matches!(self, WorkflowEvent::AgentMessage { .. })
    }
}

struct SessionChannel {
    critical_tx: mpsc::Sender<WorkflowEvent>,
    /// Parked until the SSE handler claims it.
    critical_rx: Mutex<Option<mpsc::Receiver<WorkflowEvent>>>,
    lossy_tx: broadcast::Sender<WorkflowEvent>,
}

/// Per-session event channels: a bounded queue for critical events
/// (producers await; nothing is lost) and a broadcast ring for agent chatter
/// (lagging clients lose the oldest messages).
#[derive(Default)]
pub struct SessionStreams {
    sessions: RwLock<HashMap<String, SessionChannel>>,
}

impl SessionStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the channels for a session. Idempotent.
    pub async fn register(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_insert_with(|| {
            let (critical_tx, critical_rx) = mpsc::channel(CRITICAL_CAPACITY);
            let (lossy_tx, _) = broadcast::channel(LOSSY_CAPACITY);
            SessionChannel {
                critical_tx,
                critical_rx: Mutex::new(Some(critical_rx)),
                lossy_tx,
            }
        });
    }

    /// Emits an event to a session. Critical events apply back-pressure;
    /// agent messages never block and may be dropped under load.
    pub async fn emit(&self, session_id: &str, event: WorkflowEvent) {
        let (critical_tx, lossy_tx) = {
            let sessions = self.sessions.read().await;
            let Some(channel) = sessions.get(session_id) else {
                debug!(session_id, "no stream registered; event dropped");
                return;
            };
            (channel.critical_tx.clone(), channel.lossy_tx.clone())
        };

        if event.is_critical() {
            if let Err(err) = critical_tx.send(event).await {
                warn!(session_id, error = %err, "critical event channel closed");
            }
        } else {
            // No receiver yet (or anymore) is fine for chatter.
            let _ = lossy_tx.send(event);
        }
    }

    /// Hands the single critical receiver to the connecting client.
    pub async fn take_critical_rx(
        &self,
        session_id: &str,
    ) -> Option<mpsc::Receiver<WorkflowEvent>> {
        let sessions = self.sessions.read().await;
        let channel = sessions.get(session_id)?;
        let rx = channel.critical_rx.lock().await.take();
        rx
    }

    pub async fn subscribe_lossy(
        &self,
        session_id: &str,
    ) -> Option<broadcast::Receiver<WorkflowEvent>> {
        let sessions = self.sessions.read().await;
        Some(sessions.get(session_id)?.lossy_tx.subscribe())
    }

    /// Drops a session's channels, ending its streams.
    pub async fn close(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_critical_events_are_never_dropped() {
        let streams = SessionStreams::new();
        streams.register("s1").await;

        streams
            .emit("s1", WorkflowEvent::status(WorkflowStatus::Running))
            .await;
        streams
            .emit(
                "s1",
                WorkflowEvent::WorkflowResult {
                    result: serde_json::json!({"ok": true}),
                },
            )
            .await;

        let mut rx = streams.take_critical_rx("s1").await.expect("receiver");
        let first = rx.recv().await.expect("first event");
        assert_eq!(first.event_type(), "workflow_status");
        let second = rx.recv().await.expect("second event");
        assert_eq!(second.event_type(), "workflow_result");
    }

    #[tokio::test]
    async fn test_agent_messages_are_lossy_but_flow() {
        let streams = SessionStreams::new();
        streams.register("s2").await;

        let mut rx = streams.subscribe_lossy("s2").await.expect("subscription");
        streams
            .emit("s2", WorkflowEvent::agent_message("Miner", "working"))
            .await;

        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type(), "agent_message");
    }

    #[tokio::test]
    async fn test_emitting_to_unknown_session_is_noop() {
        let streams = SessionStreams::new();
        streams
            .emit("ghost", WorkflowEvent::status(WorkflowStatus::Running))
            .await;
    }

    #[tokio::test]
    async fn test_critical_receiver_is_taken_once() {
        let streams = SessionStreams::new();
        streams.register("s3").await;
        assert!(streams.take_critical_rx("s3").await.is_some());
        assert!(streams.take_critical_rx("s3").await.is_none());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = WorkflowEvent::failed("canceled");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json.get("type"), Some(&serde_json::json!("workflow_status")));
        assert_eq!(json.get("status"), Some(&serde_json::json!("failed")));
        assert_eq!(json.get("error"), Some(&serde_json::json!("canceled")));
    }
}
