use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::{error::AppError, model::Requirement};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub const TOPIC_PLAN: &str = "requirements.plan";
pub const TOPIC_SOLVE: &str = "requirements.solve";
pub const TOPIC_VERIFY: &str = "requirements.verify";
pub const TOPIC_DTO: &str = "requirements.dto";
pub const TOPIC_TRACE: &str = "requirements.trace";

/// Identity of an agent within the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentId {
    pub agent_type: String,
    pub key: String,
}

impl AgentId {
    pub fn new(agent_type: &str, key: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            key: key.to_string(),
        }
    }
}

/// Context that travels unchanged through every dispatch a publish spawns.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub correlation_id: String,
    pub req_id: Option<String>,
    pub session_id: Option<String>,
    pub topic: Option<String>,
    pub origin_agent: Option<AgentId>,
    pub meta: serde_json::Value,
}

impl MessageContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            req_id: None,
            session_id: None,
            topic: None,
            origin_agent: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_req_id(mut self, req_id: Option<String>) -> Self {
        self.req_id = req_id;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Typed payloads carried over the bus, one shape per topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    Plan {
        task: String,
        req_id: Option<String>,
    },
    Solve {
        task: String,
        req_id: Option<String>,
        plan: String,
        critique: Option<String>,
    },
    Verify {
        task: String,
        req_id: Option<String>,
        final_answer: String,
        evidence: String,
    },
    Dto {
        req_id: String,
        title: String,
    },
    /// Requirement DTO mined in batch mode, forwarded to external sinks.
    MinedDto {
        requirement: Requirement,
    },
    Trace {
        agent: String,
        blocks: BTreeMap<String, String>,
    },
}

#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn on_message(&self, message: BusMessage, ctx: &MessageContext) -> Result<(), AppError>;
}

struct TopicState {
    handlers: Vec<(String, Arc<dyn AgentHandler>)>,
    /// Serializes dispatch so publishes to one topic are strict FIFO and a
    /// publish only returns once every handler ran.
    dispatch: Arc<Mutex<()>>,
}

/// In-process topic pub/sub with ordered, sequential dispatch per topic.
/// Built once at startup and passed by reference; no global state.
#[derive(Default)]
pub struct MessageBus {
    topics: RwLock<HashMap<String, TopicState>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        agent_type: &str,
        handler: Arc<dyn AgentHandler>,
    ) {
        let mut topics = self.topics.write().await;
        let state = topics.entry(topic.to_string()).or_insert_with(|| TopicState {
            handlers: Vec::new(),
            dispatch: Arc::new(Mutex::new(())),
        });
        state.handlers.push((agent_type.to_string(), handler));
        info!(
            agent_type,
            topic,
            subscribers = state.handlers.len(),
            "subscribed agent to topic"
        );
    }

    /// Removes every handler an agent type registered on a topic. Used by
    /// short-lived collectors (e.g. reflection runs) to avoid accumulating
    /// dead subscriptions.
    pub async fn unsubscribe(&self, topic: &str, agent_type: &str) {
        let mut topics = self.topics.write().await;
        if let Some(state) = topics.get_mut(topic) {
            state.handlers.retain(|(kind, _)| kind != agent_type);
        }
    }

    /// Dispatches to all subscribers sequentially. Handler errors are logged
    /// and swallowed; a failing handler is not retried.
    pub async fn publish(&self, topic: &str, message: BusMessage, ctx: &MessageContext) {
        if topic.is_empty() {
            warn!("publish called with empty topic; dropping message");
            return;
        }

        // Snapshot handlers without holding the registry lock during awaits.
        let (handlers, dispatch) = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(state) => (state.handlers.clone(), Arc::clone(&state.dispatch)),
                None => {
                    info!(topic, "no subscribers for topic; message ignored");
                    return;
                }
            }
        };

        let mut ctx = ctx.clone();
        ctx.topic = Some(topic.to_string());

        debug!(topic, subscribers = handlers.len(), "publishing to topic");
        let _ordering_guard = dispatch.lock().await;
        for (agent_type, handler) in handlers {
            if let Err(err) = handler.on_message(message.clone(), &ctx).await {
                error!(
                    agent_type = %agent_type,
                    topic = %topic,
                    correlation_id = %ctx.correlation_id,
                    error = %err,
                    "handler failed"
                );
            }
        }
    }
}
