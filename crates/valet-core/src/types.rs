use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MAX_HISTORY;

/// Who produced a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single message in a session's conversation history.
///
/// Invariants (enforced by the constructors):
/// user/assistant messages carry text and no data; tool messages carry a
/// tool name and structured data (text optional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(text.into()),
            data: None,
            tool_name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(text.into()),
            data: None,
            tool_name: None,
        }
    }

    pub fn tool(name: impl Into<String>, data: Value) -> Self {
        Self {
            role: Role::Tool,
            content: None,
            data: Some(data),
            tool_name: Some(name.into()),
        }
    }
}

/// Bounded, append-only conversation history for one session.
///
/// Oldest messages are evicted first when the cap is exceeded. Eviction never
/// inspects the tail: a dangling assistant message that was about to call a
/// tool is evicted like any other (the model is expected to recover).
#[derive(Debug, Clone)]
pub struct History {
    messages: VecDeque<ChatMessage>,
    cap: usize,
}

impl History {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.cap {
            self.messages.pop_front();
        }
    }

    /// Clone the current contents for a model call.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_caps_at_limit() {
        let mut h = History::with_capacity(3);
        for i in 0..10 {
            h.push(ChatMessage::user(format!("m{i}")));
        }
        assert_eq!(h.len(), 3);
        let snap = h.snapshot();
        assert_eq!(snap[0].content.as_deref(), Some("m7"));
        assert_eq!(snap[2].content.as_deref(), Some("m9"));
    }

    #[test]
    fn history_evicts_oldest_first() {
        let mut h = History::with_capacity(2);
        h.push(ChatMessage::user("first"));
        h.push(ChatMessage::assistant("second"));
        h.push(ChatMessage::tool("srv:op", serde_json::json!({"ok": true})));
        let snap = h.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].role, Role::Assistant);
        assert_eq!(snap[1].role, Role::Tool);
    }

    #[test]
    fn tool_message_shape() {
        let m = ChatMessage::tool("mem:search", serde_json::json!({"hits": 3}));
        assert_eq!(m.role, Role::Tool);
        assert!(m.content.is_none());
        assert_eq!(m.tool_name.as_deref(), Some("mem:search"));
        assert!(m.data.is_some());
    }

    #[test]
    fn role_serializes_lowercase() {
        let m = ChatMessage::user("hi");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains(r#""role":"user""#));
        // absent fields are omitted from the wire shape
        assert!(!json.contains("tool_name"));
    }
}
