use std::{sync::Arc, time::Duration};

use async_openai::types::{
    ChatCompletionNamedToolChoice, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, ChatCompletionTool, ChatCompletionToolChoiceOption,
    ChatCompletionToolType, CreateChatCompletionRequest, FunctionName, FunctionObject,
    ResponseFormat,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A function tool the model is forced to call.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Overrides the client's default model when set.
    pub model: Option<String>,
    pub tool: Option<ToolSpec>,
    pub json_response: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            model: None,
            tool: None,
            json_response: false,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_json_response(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// What the model produced: plain text or the arguments of a forced tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Text(String),
    ToolCall { name: String, arguments: String },
}

impl ChatOutcome {
    pub fn into_text(self) -> String {
        match self {
            ChatOutcome::Text(text) => text,
            ChatOutcome::ToolCall { arguments, .. } => arguments,
        }
    }
}

/// The single seam to the LLM provider. Failures are values, never panics;
/// every call carries its own deadline.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatOutcome, AppError>;
}

pub struct OpenAiChatClient {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    default_model: String,
    call_timeout: Duration,
}

impl OpenAiChatClient {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        default_model: String,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            default_model,
            call_timeout,
        }
    }

    fn convert_message(message: &ChatMessage) -> ChatCompletionRequestMessage {
        match message.role {
            ChatRole::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content:
                        async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                            message.content.clone(),
                        ),
                    name: None,
                })
            }
            ChatRole::User => {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: async_openai::types::ChatCompletionRequestUserMessageContent::Text(
                        message.content.clone(),
                    ),
                    name: None,
                })
            }
            ChatRole::Assistant => {
                #[allow(deprecated)]
                let assistant =
                    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                        content: Some(
                            async_openai::types::ChatCompletionRequestAssistantMessageContent::Text(
                                message.content.clone(),
                            ),
                        ),
                        name: None,
                        tool_calls: None,
                        refusal: None,
                        audio: None,
                        function_call: None,
                    });
                assistant
            }
        }
    }

    fn build_request(&self, request: &ChatRequest) -> CreateChatCompletionRequest {
        let messages: Vec<_> = request.messages.iter().map(Self::convert_message).collect();

        let (tools, tool_choice) = match &request.tool {
            Some(tool) => (
                Some(vec![ChatCompletionTool {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionObject {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: Some(tool.parameters.clone()),
                        strict: None,
                    },
                }]),
                Some(ChatCompletionToolChoiceOption::Named(
                    ChatCompletionNamedToolChoice {
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionName {
                            name: tool.name.clone(),
                        },
                    },
                )),
            ),
            None => (None, None),
        };

        let response_format = request.json_response.then_some(ResponseFormat::JsonObject);

        CreateChatCompletionRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            messages,
            temperature: Some(request.temperature),
            response_format,
            tools,
            tool_choice,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatOutcome, AppError> {
        let openai_request = self.build_request(&request);

        let response = tokio::time::timeout(
            self.call_timeout,
            self.client.chat().create(openai_request),
        )
        .await
        .map_err(|_| AppError::Timeout(self.call_timeout.as_secs()))??;

        let Some(choice) = response.choices.into_iter().next() else {
            return Err(AppError::LLMParsing("No choices in LLM response".into()));
        };

        if let Some(tool_call) = choice
            .message
            .tool_calls
            .and_then(|calls| calls.into_iter().next())
        {
            return Ok(ChatOutcome::ToolCall {
                name: tool_call.function.name,
                arguments: tool_call.function.arguments,
            });
        }

        let content = choice
            .message
            .content
            .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))?;

        Ok(ChatOutcome::Text(content))
    }
}

/// Strips a single wrapping markdown code fence, including an optional
/// language token, and trims the result.
pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.last().map(|l| l.trim()) == Some("```") {
        lines.pop();
    }
    if !lines.is_empty() {
        lines.remove(0);
    }
    lines.join("\n").trim().to_string()
}

/// Extracts the first JSON object or array from raw LLM output, tolerating
/// fences and surrounding prose.
pub fn extract_json_str(raw: &str) -> Result<String, AppError> {
    let s = strip_markdown_fences(raw);
    if serde_json::from_str::<serde_json::Value>(&s).is_ok() {
        return Ok(s);
    }

    let start_obj = s.find('{');
    let start_arr = s.find('[');
    let start = match (start_obj, start_arr) {
        (Some(o), Some(a)) => o.min(a),
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => {
            return Err(AppError::LLMParsing("No JSON start found in LLM output".into()))
        }
    };
    let end_obj = s.rfind('}');
    let end_arr = s.rfind(']');
    let end = match (end_obj, end_arr) {
        (Some(o), Some(a)) => o.max(a),
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => {
            return Err(AppError::LLMParsing("No JSON end found in LLM output".into()))
        }
    };
    if end < start {
        return Err(AppError::LLMParsing("Malformed JSON in LLM output".into()));
    }

    let candidate = s
        .get(start..=end)
        .ok_or_else(|| AppError::LLMParsing("Malformed JSON in LLM output".into()))?
        .trim()
        .to_string();
    serde_json::from_str::<serde_json::Value>(&candidate)
        .map_err(|e| AppError::LLMParsing(format!("Invalid JSON in LLM output: {e}")))?;
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_fences_removes_language_token() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(fenced), "{\"a\": 1}");
    }

    #[test]
    fn strip_fences_leaves_plain_text_alone() {
        assert_eq!(strip_markdown_fences("  plain  "), "plain");
    }

    #[test]
    fn extract_json_from_prose() {
        let raw = "Here you go:\n{\"items\": []}\nanything else?";
        assert_eq!(extract_json_str(raw).expect("json"), "{\"items\": []}");
    }

    #[test]
    fn extract_json_rejects_json_free_text() {
        assert!(extract_json_str("no json here").is_err());
    }
}
