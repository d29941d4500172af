use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    llm::{ChatClient, ChatMessage, ChatRequest},
};
use tracing::{error, warn};

use crate::{
    blocks::extract_blocks,
    bus::{AgentHandler, BusMessage, MessageBus, MessageContext, TOPIC_SOLVE, TOPIC_TRACE},
    context::AgentContext,
    trace::{trace_from_blocks, TraceSink},
};

use super::{BASE_PROMPT_GUARD, REQUIREMENTS_POLICY};

const PLANNER_FALLBACK: &str = "THOUGHTS: fallback\nPLAN:\n\
- Analyze the task and constraints\n\
- Retrieve relevant context\n\
- Propose refined requirement(s)\n\
- Verify\n";

/// Produces a short PLAN (plus internal THOUGHTS) for a task and hands off
/// to the solver.
pub struct PlannerAgent {
    chat: Arc<dyn ChatClient>,
    bus: Arc<MessageBus>,
    context: Arc<AgentContext>,
    trace_sink: Arc<dyn TraceSink>,
    temperature: f32,
}

impl PlannerAgent {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        bus: Arc<MessageBus>,
        context: Arc<AgentContext>,
        trace_sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            chat,
            bus,
            context,
            trace_sink,
            temperature: 0.2,
        }
    }
}

#[async_trait]
impl AgentHandler for PlannerAgent {
    async fn on_message(&self, message: BusMessage, ctx: &MessageContext) -> Result<(), AppError> {
        let BusMessage::Plan { task, req_id } = message else {
            return Ok(());
        };
        if task.trim().is_empty() {
            warn!("planner received empty task; skipping");
            return Ok(());
        }

        let system_msg = format!(
            "{BASE_PROMPT_GUARD}\n{REQUIREMENTS_POLICY}\n\
             You are the Planner. Produce a short execution plan for the team to derive refined requirements.\n\
             Output strictly with the following sections:\nTHOUGHTS:\nPLAN:\n"
        );
        let user_msg = format!(
            "Task:\n{task}\n\nConstraints:\n- Keep plan minimal (3-6 bullets)\n- Do not include implementation code\n"
        );

        let mut messages = vec![ChatMessage::system(system_msg.clone())];
        for prior in self.context.get_messages(None).await {
            if prior.role != common::llm::ChatRole::System {
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
                error!(error = %err, "planner chat failed; using fallback plan");
                PLANNER_FALLBACK.to_string()
            }
        };

        let blocks = extract_blocks(&content);
        self.context.add_message(ChatMessage::assistant(content)).await;

        if let Err(err) = self
            .trace_sink
            .record(trace_from_blocks("planner", ctx, &blocks))
            .await
        {
            warn!(error = %err, "planner trace persist failed");
        }

        self.bus
            .publish(
                TOPIC_TRACE,
                BusMessage::Trace {
                    agent: "planner".to_string(),
                    blocks: blocks.clone(),
                },
                ctx,
            )
            .await;

        let plan = blocks.get("PLAN").cloned().unwrap_or_default();
        self.bus
            .publish(
                TOPIC_SOLVE,
                BusMessage::Solve {
                    task,
                    req_id,
                    plan,
                    critique: None,
                },
                ctx,
            )
            .await;

        Ok(())
    }
}
