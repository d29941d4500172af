use std::collections::VecDeque;

use common::llm::{ChatMessage, ChatRole};
use tokio::sync::Mutex;

const DEFAULT_MAX_LEN: usize = 12;

/// Bounded conversation memory for one agent chain. Overflow drops the
/// oldest entries; readers always get a snapshot copy.
pub struct AgentContext {
    max_len: usize,
    messages: Mutex<VecDeque<ChatMessage>>,
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}

impl AgentContext {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            messages: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn add_message(&self, message: ChatMessage) {
        if !matches!(
            message.role,
            ChatRole::System | ChatRole::User | ChatRole::Assistant
        ) {
            return;
        }
        let mut messages = self.messages.lock().await;
        messages.push_back(message);
        while messages.len() > self.max_len {
            messages.pop_front();
        }
    }

    /// The most recent `limit` messages (all when `None`), oldest first.
    pub async fn get_messages(&self, limit: Option<usize>) -> Vec<ChatMessage> {
        let messages = self.messages.lock().await;
        match limit {
            Some(limit) if limit < messages.len() => messages
                .iter()
                .skip(messages.len().saturating_sub(limit))
                .cloned()
                .collect(),
            _ => messages.iter().cloned().collect(),
        }
    }

    pub async fn reset(&self) {
        self.messages.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let context = AgentContext::new(3);
        for i in 0..5 {
            context.add_message(ChatMessage::user(format!("m{i}"))).await;
        }

        let messages = context.get_messages(None).await;
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_limit_returns_most_recent() {
        let context = AgentContext::default();
        context.add_message(ChatMessage::system("sys")).await;
        context.add_message(ChatMessage::user("u1")).await;
        context.add_message(ChatMessage::assistant("a1")).await;

        let last_two = context.get_messages(Some(2)).await;
        let contents: Vec<&str> = last_two.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["u1", "a1"]);
    }

    #[tokio::test]
    async fn test_reset_clears_buffer() {
        let context = AgentContext::default();
        context.add_message(ChatMessage::user("hello")).await;
        context.reset().await;
        assert!(context.get_messages(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_consistent_state() {
        let context = std::sync::Arc::new(AgentContext::new(64));
        let mut handles = Vec::new();
        for i in 0..16 {
            let context = std::sync::Arc::clone(&context);
            handles.push(tokio::spawn(async move {
                context.add_message(ChatMessage::user(format!("m{i}"))).await;
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(context.get_messages(None).await.len(), 16);
    }
}
