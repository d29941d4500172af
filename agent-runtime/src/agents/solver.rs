use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    llm::{ChatClient, ChatMessage, ChatRequest, ChatRole},
    storage::vector::{VectorStore, REQUIREMENTS_COLLECTION},
    utils::embedding::Embedder,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    blocks::extract_blocks,
    bus::{
        AgentHandler, BusMessage, MessageBus, MessageContext, TOPIC_DTO, TOPIC_TRACE, TOPIC_VERIFY,
    },
    context::AgentContext,
    trace::{trace_from_blocks, TraceSink},
    workbench::Workbench,
};

use super::{BASE_PROMPT_GUARD, REQUIREMENTS_POLICY};

const RETRIEVAL_TOP_K: usize = 5;
const SNIPPET_CHARS: usize = 120;

/// Uses retrieved context and the plan to craft refined requirements,
/// optionally invoking one workbench tool whose result feeds a second LLM
/// turn that supersedes the first.
pub struct SolverAgent {
    chat: Arc<dyn ChatClient>,
    bus: Arc<MessageBus>,
    context: Arc<AgentContext>,
    trace_sink: Arc<dyn TraceSink>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    workbench: Option<Arc<Workbench>>,
    temperature: f32,
}

impl SolverAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatClient>,
        bus: Arc<MessageBus>,
        context: Arc<AgentContext>,
        trace_sink: Arc<dyn TraceSink>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        workbench: Option<Arc<Workbench>>,
    ) -> Self {
        Self {
            chat,
            bus,
            context,
            trace_sink,
            store,
            embedder,
            workbench,
            temperature: 0.2,
        }
    }

    /// Top-k context lines for the prompt MEMORY section. Retrieval failures
    /// degrade to an empty memory, never to an error.
    async fn memory_lines(&self, query: &str) -> Vec<String> {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "solver retrieval embedding failed");
                return Vec::new();
            }
        };

        match self
            .store
            .search(REQUIREMENTS_COLLECTION, embedding, RETRIEVAL_TOP_K, None)
            .await
        {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| {
                    let source = hit
                        .payload
                        .get("sourceFile")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let snippet: String = hit
                        .payload
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .chars()
                        .take(SNIPPET_CHARS)
                        .collect();
                    format!(
                        "MEMORY_{} | {:.3} | {} | {}",
                        hit.id,
                        hit.score,
                        source,
                        snippet.replace('\n', " ")
                    )
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "solver retrieval failed");
                Vec::new()
            }
        }
    }

    fn tool_descriptions(&self) -> String {
        let Some(workbench) = &self.workbench else {
            return String::new();
        };
        let tools = workbench.list();
        if tools.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!("Available tools:\n{}\n", lines.join("\n"))
    }

    async fn complete_with_history(
        &self,
        system_msg: &str,
        user_msg: &str,
    ) -> Result<String, AppError> {
        let mut messages = vec![ChatMessage::system(system_msg.to_string())];
        for prior in self.context.get_messages(None).await {
            if prior.role != ChatRole::System {
                messages.push(prior);
            }
        }
        messages.push(ChatMessage::user(user_msg.to_string()));

        self.context
            .add_message(ChatMessage::system(system_msg.to_string()))
            .await;
        self.context
            .add_message(ChatMessage::user(user_msg.to_string()))
            .await;

        let outcome = self
            .chat
            .complete(ChatRequest::new(messages, self.temperature))
            .await?;
        let text = outcome.into_text();
        self.context
            .add_message(ChatMessage::assistant(text.clone()))
            .await;
        Ok(text)
    }
}

#[async_trait]
impl AgentHandler for SolverAgent {
    async fn on_message(&self, message: BusMessage, ctx: &MessageContext) -> Result<(), AppError> {
        let BusMessage::Solve {
            task,
            req_id,
            plan,
            critique,
        } = message
        else {
            return Ok(());
        };
        if task.trim().is_empty() {
            warn!("solver received empty task; skipping");
            return Ok(());
        }
        let req_id = req_id.or_else(|| ctx.req_id.clone());

        let memory_lines = self.memory_lines(&task).await;
        let memory_section = if memory_lines.is_empty() {
            String::new()
        } else {
            let bullets: Vec<String> = memory_lines.iter().map(|l| format!("- {l}")).collect();
            format!("MEMORY:\n{}\n", bullets.join("\n"))
        };

        let system_msg = format!(
            "{BASE_PROMPT_GUARD}\n{REQUIREMENTS_POLICY}\n\
             You are the Solver. Use the provided MEMORY (if any) and PLAN to craft refined requirement(s).\n\
             {tools}If you need a tool, emit one TOOL_CALL: {{\"tool\": \"...\", \"args\": {{...}}}}.\n\
             Output strictly with the following sections:\nTHOUGHTS:\nEVIDENCE:\nFINAL_ANSWER:\n",
            tools = self.tool_descriptions()
        );

        let mut user_msg = format!(
            "Task:\n{task}\n\nPlan:\n{plan}\n\n{memory_section}\
             Constraints:\n- Keep output short and actionable\n- Avoid code\n"
        );
        if let Some(critique) = critique.as_deref().filter(|c| !c.trim().is_empty()) {
            user_msg.push_str(&format!("\nPRIOR_CRITIQUE:\n{critique}\n"));
        }

        let content = match self.complete_with_history(&system_msg, &user_msg).await {
            Ok(content) => content,
            Err(err) => {
                error!(error = %err, "solver chat failed");
                return Ok(());
            }
        };

        let mut blocks = extract_blocks(&content);

        // One optional tool round: the second completion supersedes the first.
        // Tool failures stay internal; only the follow-up answer travels on.
        if let Some(workbench) = &self.workbench {
            let tool_call = blocks
                .get("TOOL_CALL")
                .and_then(|raw| Workbench::from_llm_output(raw))
                .or_else(|| Workbench::from_llm_output(&content));
            if let Some((name, args)) = tool_call {
                debug!(tool = %name, "solver invoking workbench tool");
                let result = workbench.call(&name, args).await;
                let result_json = serde_json::to_string(&result)
                    .unwrap_or_else(|_| "{\"status\":\"error\"}".to_string());
                let followup = format!(
                    "TOOL_RESULT for {name}:\n{result_json}\n\n\
                     Use this result to finalize your answer. Output strictly with\n\
                     THOUGHTS:\nEVIDENCE:\nFINAL_ANSWER:\n"
                );
                match self.complete_with_history(&system_msg, &followup).await {
                    Ok(second) => blocks = extract_blocks(&second),
                    Err(err) => warn!(error = %err, "solver tool follow-up failed"),
                }
            }
        }

        if let Err(err) = self
            .trace_sink
            .record(trace_from_blocks("solver", ctx, &blocks))
            .await
        {
            warn!(error = %err, "solver trace persist failed");
        }

        self.bus
            .publish(
                TOPIC_TRACE,
                BusMessage::Trace {
                    agent: "solver".to_string(),
                    blocks: blocks.clone(),
                },
                ctx,
            )
            .await;

        let final_answer = blocks.get("FINAL_ANSWER").cloned().unwrap_or_default();
        let evidence = blocks.get("EVIDENCE").cloned().unwrap_or_default();

        self.bus
            .publish(
                TOPIC_VERIFY,
                BusMessage::Verify {
                    task,
                    req_id: req_id.clone(),
                    final_answer: final_answer.clone(),
                    evidence,
                },
                ctx,
            )
            .await;

        if !final_answer.trim().is_empty() {
            self.bus
                .publish(
                    TOPIC_DTO,
                    BusMessage::Dto {
                        req_id: req_id.unwrap_or_else(|| "REQ-001".to_string()),
                        title: final_answer,
                    },
                    ctx,
                )
                .await;
        }

        Ok(())
    }
}
