use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::trace_record::TraceRecord,
        vector::{VectorRecord, VectorStore, TRACE_COLLECTION},
    },
    utils::embedding::Embedder,
};
use serde_json::json;
use tracing::warn;

use crate::bus::MessageContext;

/// Where agent traces land. Traces keep the full chain of thought for audit;
/// they are never surfaced to clients.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn record(&self, trace: TraceRecord) -> Result<(), AppError>;
}

/// Builds a trace record from extracted blocks, carrying the message context.
pub fn trace_from_blocks(
    agent_type: &str,
    ctx: &MessageContext,
    blocks: &BTreeMap<String, String>,
) -> TraceRecord {
    let get = |key: &str| blocks.get(key).cloned().unwrap_or_default();
    let mut meta = json!({ "correlation_id": ctx.correlation_id });
    if let Some(tool_call) = blocks.get("TOOL_CALL") {
        if let Some((name, args)) = crate::workbench::Workbench::from_llm_output(tool_call) {
            meta["tool_calls"] = json!([{ "tool": name, "args": args }]);
        }
    }

    TraceRecord::new(
        agent_type.to_string(),
        ctx.req_id.clone(),
        ctx.session_id.clone(),
        get("THOUGHTS"),
        get("PLAN"),
        get("EVIDENCE"),
        get("FINAL_ANSWER"),
        get("CRITIQUE"),
        get("DECISION"),
        meta,
    )
}

/// Persists traces to the relational table and mirrors the final answer into
/// the trace vector collection for later semantic lookup.
pub struct SurrealTraceSink {
    db: Arc<SurrealDbClient>,
    store: Arc<dyn VectorStore>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl SurrealTraceSink {
    pub fn new(
        db: Arc<SurrealDbClient>,
        store: Arc<dyn VectorStore>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            db,
            store,
            embedder,
        }
    }
}

#[async_trait]
impl TraceSink for SurrealTraceSink {
    async fn record(&self, trace: TraceRecord) -> Result<(), AppError> {
        let final_answer = trace.final_answer.clone();
        let payload = json!({
            "req_id": trace.req_id,
            "agent_type": trace.agent_type,
            "session_id": trace.session_id,
            "final": trace.final_answer,
        });
        let trace_id = trace.id.clone();

        self.db.store_item(trace).await?;

        if final_answer.trim().is_empty() {
            return Ok(());
        }

        if let Some(embedder) = &self.embedder {
            match embedder.embed(&final_answer).await {
                Ok(embedding) => {
                    let record = VectorRecord {
                        id: trace_id,
                        embedding: Some(embedding),
                        payload,
                    };
                    if let Err(err) = self.store.upsert(TRACE_COLLECTION, vec![record]).await {
                        warn!(error = %err, "trace vector upsert failed");
                    }
                }
                Err(err) => warn!(error = %err, "trace embedding failed"),
            }
        }

        Ok(())
    }
}

/// Sink that drops traces. Used by tests and lightweight runs.
#[derive(Default)]
pub struct NoopTraceSink;

#[async_trait]
impl TraceSink for NoopTraceSink {
    async fn record(&self, _trace: TraceRecord) -> Result<(), AppError> {
        Ok(())
    }
}
