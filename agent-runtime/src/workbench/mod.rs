mod vector_search;

pub use vector_search::VectorSearchTool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

/// Uniform result of a workbench tool call. Tool payloads are internal agent
/// evidence; they never reach the client stream directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(content: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            content,
            error: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            content: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Timeout,
            content: Value::Null,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    /// Cheap argument check before `run`. Errors become `ToolResult::fail`.
    fn validate(&self, _args: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn run(&self, args: Value) -> ToolResult;
}

/// Explicit tool registry built at startup. Agents call tools by name via a
/// JSON tool-call block; unknown names and validation failures come back as
/// failed results, never as panics.
#[derive(Default)]
pub struct Workbench {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Workbench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return;
        }
        self.tools.insert(name, tool);
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        let mut out: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|tool| ToolInfo {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn call(&self, name: &str, args: Value) -> ToolResult {
        if !args.is_object() {
            return ToolResult::fail("args must be an object");
        }
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::fail(format!("Unknown tool: {name}"));
        };

        if let Err(message) = tool.validate(&args) {
            return ToolResult::fail(format!("Validation error in '{name}': {message}"));
        }

        tool.run(args).await
    }

    /// Extracts the first valid JSON tool call from LLM output. Accepts the
    /// current protocol `{"tool": ..., "args": {...}}` and the legacy
    /// `{"name": ..., "arguments": {...}}`, with or without markdown fences.
    pub fn from_llm_output(text: &str) -> Option<(String, Value)> {
        if text.trim().is_empty() {
            return None;
        }

        let mut candidates: Vec<String> = fenced_bodies(text);
        if candidates.is_empty() {
            if let Some(extracted) = extract_first_json_object(text) {
                candidates.push(extracted);
            }
        }
        candidates.push(text.trim().to_string());

        for raw in candidates {
            let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            let Some(object) = value.as_object() else {
                continue;
            };
            for (name_key, args_key) in [("tool", "args"), ("name", "arguments")] {
                let name = object
                    .get(name_key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|n| !n.is_empty());
                let args = object.get(args_key).filter(|a| a.is_object());
                if let (Some(name), Some(args)) = (name, args) {
                    return Some((name.to_string(), args.clone()));
                }
            }
        }

        None
    }
}

/// Bodies of ```-fenced blocks, language tokens dropped.
fn fenced_bodies(text: &str) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = match rest.get(open.saturating_add(3)..) {
            Some(s) => s,
            None => break,
        };
        // Skip an optional language token up to the first newline.
        let body_offset = after_open.find('\n').map_or(0, |n| n.saturating_add(1));
        let Some(body_and_rest) = after_open.get(body_offset..) else {
            break;
        };
        let Some(close) = body_and_rest.find("```") else {
            break;
        };
        if let Some(body) = body_and_rest.get(..close) {
            let body = body.trim();
            if !body.is_empty() {
                bodies.push(body.to_string());
            }
        }
        rest = body_and_rest.get(close.saturating_add(3)..).unwrap_or_default();
    }
    bodies
}

/// Balanced-brace extraction of the first JSON object, skipping string
/// contents. Robust enough for typical LLM output.
fn extract_first_json_object(s: &str) -> Option<String> {
    let mut start: Option<usize> = None;
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if ch == '"' && !escaped {
            in_string = !in_string;
        }
        escaped = ch == '\\' && !escaped;

        if in_string {
            continue;
        }

        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth = depth.saturating_add(1);
            }
            '}' => {
                if depth > 0 {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if let Some(start) = start {
                            return s.get(start..=i).map(str::to_string);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its arguments"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn validate(&self, args: &Value) -> Result<(), String> {
            if args.get("text").is_none() {
                return Err("missing 'text'".to_string());
            }
            Ok(())
        }

        async fn run(&self, args: Value) -> ToolResult {
            ToolResult::success(args)
        }
    }

    #[tokio::test]
    async fn test_call_success_and_validation() {
        let mut workbench = Workbench::new();
        workbench.register(Arc::new(Echo));

        let ok = workbench.call("echo", json!({"text": "hi"})).await;
        assert_eq!(ok.status, ToolStatus::Success);

        let invalid = workbench.call("echo", json!({})).await;
        assert_eq!(invalid.status, ToolStatus::Error);
        assert!(invalid.error.is_some_and(|e| e.contains("missing 'text'")));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_cleanly() {
        let workbench = Workbench::new();
        let result = workbench.call("nope", json!({})).await;
        assert_eq!(result.status, ToolStatus::Error);
    }

    #[test]
    fn test_from_llm_output_parses_current_protocol() {
        let text = "Sure:\n```json\n{\"tool\": \"vector_search\", \"args\": {\"query\": \"sso\"}}\n```";
        let (name, args) = Workbench::from_llm_output(text).expect("tool call");
        assert_eq!(name, "vector_search");
        assert_eq!(args, json!({"query": "sso"}));
    }

    #[test]
    fn test_from_llm_output_parses_legacy_protocol() {
        let text = "{\"name\": \"python_exec\", \"arguments\": {\"code\": \"print(1)\"}}";
        let (name, args) = Workbench::from_llm_output(text).expect("tool call");
        assert_eq!(name, "python_exec");
        assert_eq!(args, json!({"code": "print(1)"}));
    }

    #[test]
    fn test_from_llm_output_finds_embedded_object() {
        let text = "I will search now. {\"tool\": \"vector_search\", \"args\": {}} thanks";
        let (name, _args) = Workbench::from_llm_output(text).expect("tool call");
        assert_eq!(name, "vector_search");
    }

    #[test]
    fn test_from_llm_output_rejects_garbage() {
        assert!(Workbench::from_llm_output("no tools here").is_none());
        assert!(Workbench::from_llm_output("").is_none());
    }
}
