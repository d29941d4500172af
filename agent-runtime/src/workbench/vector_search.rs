use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    storage::vector::{VectorStore, REQUIREMENTS_COLLECTION},
    utils::embedding::Embedder,
};
use serde_json::{json, Value};
use tracing::debug;

use super::{Tool, ToolResult};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TOP_K: usize = 5;
const SNIPPET_CHARS: usize = 160;

/// Semantic search over the ingested requirement chunks. This is the memory
/// the solver and verifier cite as EVIDENCE.
pub struct VectorSearchTool {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl VectorSearchTool {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Value, String> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| format!("embedding failed: {e}"))?;

        let hits = self
            .store
            .search(REQUIREMENTS_COLLECTION, embedding, top_k, None)
            .await
            .map_err(|e| format!("vector search failed: {e}"))?;

        debug!(hits = hits.len(), "vector_search tool results");

        let rows: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                let source = hit
                    .payload
                    .get("sourceFile")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let snippet: String = hit
                    .payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .chars()
                    .take(SNIPPET_CHARS)
                    .collect();
                json!({
                    "id": hit.id,
                    "score": hit.score,
                    "source": source,
                    "snippet": snippet.replace('\n', " "),
                })
            })
            .collect();

        Ok(Value::Array(rows))
    }
}

#[async_trait]
impl Tool for VectorSearchTool {
    fn name(&self) -> &str {
        "vector_search"
    }

    fn description(&self) -> &str {
        "Semantic search over ingested requirement chunks; returns id, score, source and snippet per hit"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "top_k": { "type": "integer", "minimum": 1, "maximum": 20 }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        match args.get("query").and_then(Value::as_str) {
            Some(query) if !query.trim().is_empty() => Ok(()),
            _ => Err("'query' must be a non-empty string".to_string()),
        }
    }

    async fn run(&self, args: Value) -> ToolResult {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_TOP_K, |k| k as usize)
            .clamp(1, 20);

        match tokio::time::timeout(SEARCH_TIMEOUT, self.search(&query, top_k)).await {
            Ok(Ok(content)) => ToolResult::success(content),
            Ok(Err(message)) => ToolResult::fail(message),
            Err(_) => ToolResult::timeout(format!(
                "vector_search timed out after {}s",
                SEARCH_TIMEOUT.as_secs()
            )),
        }
    }
}
