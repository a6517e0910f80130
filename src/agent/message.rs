//! Message and tool-call types for a conversation exchange

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    /// Tool calls made by assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool call ID (for tool results)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool name (for tool results)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message with tool calls
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// Create a tool result message
    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, result);
        msg.tool_call_id = Some(call_id.into());
        msg.name = Some(name.into());
        msg
    }

    /// Tool calls carried by this message, empty when there are none.
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

/// Lifecycle of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::Success | ToolStatus::Error)
    }

    /// Transitions only move forward: `pending -> running -> success|error`,
    /// plus `pending -> error` for calls that never got to run.
    pub fn can_transition_to(self, next: ToolStatus) -> bool {
        matches!(
            (self, next),
            (ToolStatus::Pending, ToolStatus::Running)
                | (ToolStatus::Pending, ToolStatus::Error)
                | (ToolStatus::Running, ToolStatus::Success)
                | (ToolStatus::Running, ToolStatus::Error)
        )
    }
}

/// A model-issued tool call and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments, always a JSON object
    pub args: Value,
    /// Arguments as the vendor sent them
    pub raw_args: String,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl ToolCall {
    /// A call seen for the first time, arguments still unknown.
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args: Value::Object(Default::default()),
            raw_args: String::new(),
            status: ToolStatus::Pending,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Move to `Running`. Returns false if the transition is not allowed.
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(ToolStatus::Running) {
            return false;
        }
        self.status = ToolStatus::Running;
        self.start_time = Some(Utc::now());
        true
    }

    /// Move to `Success` with `result`.
    pub fn succeed(&mut self, result: Value) -> bool {
        if !self.status.can_transition_to(ToolStatus::Success) {
            return false;
        }
        self.status = ToolStatus::Success;
        self.result = Some(result);
        self.end_time = Some(Utc::now());
        true
    }

    /// Move to `Error` with `error`.
    pub fn fail(&mut self, error: impl Into<String>, result: Option<Value>) -> bool {
        if !self.status.can_transition_to(ToolStatus::Error) {
            return false;
        }
        self.status = ToolStatus::Error;
        self.error = Some(error.into());
        self.result = result;
        self.end_time = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.calls().is_empty());
        assert_ne!(msg.id, Message::user("Hello").id);
    }

    #[test]
    fn test_tool_result_links_call() {
        let msg = Message::tool_result("call_1", "read_file", "contents");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("read_file"));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut call = ToolCall::pending("call_1", "read_file");
        assert!(call.start());
        assert!(!call.start());
        assert!(call.succeed(json!("ok")));
        assert!(!call.fail("late", None));
        assert!(!call.start());
        assert_eq!(call.status, ToolStatus::Success);
        assert!(call.start_time.is_some() && call.end_time.is_some());
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut call = ToolCall::pending("call_1", "read_file");
        assert!(call.fail("cancelled", None));
        assert!(call.status.is_terminal());
        assert!(!call.succeed(json!(null)));
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        assert_eq!(serde_json::to_string(&ToolStatus::Running).unwrap(), "\"running\"");
    }
}
