use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    llm::{ChatClient, ChatMessage, ChatRequest, ChatRole},
};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::{
    blocks::extract_blocks,
    bus::{AgentHandler, BusMessage, MessageBus, MessageContext, TOPIC_TRACE},
    context::AgentContext,
    trace::{trace_from_blocks, TraceSink},
    workbench::{ToolStatus, Workbench},
};

use super::{BASE_PROMPT_GUARD, REQUIREMENTS_POLICY};

const MIN_CITES: usize = 1;

/// Judges FINAL_ANSWER against EVIDENCE and emits CRITIQUE plus a DECISION.
pub struct VerifierAgent {
    chat: Arc<dyn ChatClient>,
    bus: Arc<MessageBus>,
    context: Arc<AgentContext>,
    trace_sink: Arc<dyn TraceSink>,
    workbench: Option<Arc<Workbench>>,
    temperature: f32,
}

impl VerifierAgent {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        bus: Arc<MessageBus>,
        context: Arc<AgentContext>,
        trace_sink: Arc<dyn TraceSink>,
        workbench: Option<Arc<Workbench>>,
    ) -> Self {
        Self {
            chat,
            bus,
            context,
            trace_sink,
            workbench,
            temperature: 0.2,
        }
    }

    /// When evidence carries too few memory citations, pull a few fresh hits
    /// so the verdict is grounded. Failures are silent.
    async fn enrich_evidence(&self, task: &str, evidence: &str) -> String {
        let cites = evidence
            .lines()
            .filter(|line| line.contains("MEMORY_"))
            .count();
        if cites >= MIN_CITES {
            return evidence.to_string();
        }
        let Some(workbench) = &self.workbench else {
            return evidence.to_string();
        };

        let result = workbench
            .call("vector_search", json!({"query": task, "top_k": 3}))
            .await;
        if result.status != ToolStatus::Success {
            return evidence.to_string();
        }
        let Some(hits) = result.content.as_array() else {
            return evidence.to_string();
        };

        let lines: Vec<String> = hits
            .iter()
            .take(3)
            .map(|hit| {
                format!(
                    "- {} | {:.3} | {} | {}",
                    hit.get("id").and_then(Value::as_str).unwrap_or_default(),
                    hit.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                    hit.get("source").and_then(Value::as_str).unwrap_or_default(),
                    hit.get("snippet").and_then(Value::as_str).unwrap_or_default(),
                )
            })
            .collect();
        if lines.is_empty() {
            return evidence.to_string();
        }
        format!("{evidence}\n\nADDITIONAL_EVIDENCE:\n{}", lines.join("\n"))
    }
}

#[async_trait]
impl AgentHandler for VerifierAgent {
    async fn on_message(&self, message: BusMessage, ctx: &MessageContext) -> Result<(), AppError> {
        let BusMessage::Verify {
            task,
            req_id: _,
            final_answer,
            evidence,
        } = message
        else {
            return Ok(());
        };
        if final_answer.trim().is_empty() {
            warn!("verifier received empty final_answer; skipping");
            return Ok(());
        }

        let system_msg = format!(
            "{BASE_PROMPT_GUARD}\n{REQUIREMENTS_POLICY}\n\
             You are the Verifier. Given FINAL_ANSWER and EVIDENCE, decide if the requirement is acceptable.\n\
             If insufficient or risky, write CRITIQUE with specific issues; else write DECISION with PASS and one-line rationale.\n\
             Output strictly with the following sections:\nCRITIQUE:\nDECISION:\n"
        );

        let enriched_evidence = self.enrich_evidence(&task, &evidence).await;
        let user_msg = format!(
            "Task:\n{task}\n\nEVIDENCE:\n{enriched_evidence}\n\nFINAL_ANSWER:\n{final_answer}\n"
        );

        let mut messages = vec![ChatMessage::system(system_msg.clone())];
        for prior in self.context.get_messages(None).await {
            if prior.role != ChatRole::System {
                messages.push(prior);
            }
        }
        messages.push(ChatMessage::user(user_msg.clone()));

        self.context.add_message(ChatMessage::system(system_msg)).await;
        self.context.add_message(ChatMessage::user(user_msg)).await;

        let content = match self
            .chat
            .complete(ChatRequest::new(messages, self.temperature))
            .await
        {
            Ok(outcome) => outcome.into_text(),
            Err(err) => {
                error!(error = %err, "verifier chat failed");
                // Without a verdict the reflection loop must not spin forever.
                "CRITIQUE:\nDECISION: REJECT - verifier unavailable\n".to_string()
            }
        };

        let blocks = extract_blocks(&content);
        self.context.add_message(ChatMessage::assistant(content)).await;

        if let Err(err) = self
            .trace_sink
            .record(trace_from_blocks("verifier", ctx, &blocks))
            .await
        {
            warn!(error = %err, "verifier trace persist failed");
        }

        self.bus
            .publish(
                TOPIC_TRACE,
                BusMessage::Trace {
                    agent: "verifier".to_string(),
                    blocks,
                },
                ctx,
            )
            .await;

        Ok(())
    }
}
