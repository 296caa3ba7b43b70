use serde::{Deserialize, Serialize};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ──────────────────── Envelope Types ────────────────────

/// Which way an envelope travels relative to the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From a channel adapter (or the scheduler) towards the agent.
    In,
    /// From the agent towards a channel adapter.
    Out,
}

/// A directional message carried on the bus.
///
/// Envelopes are immutable once published; subscribers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Unique envelope ID.
    pub id: String,
    /// Session key for conversation continuity.
    pub session_key: String,
    /// Channel type (e.g. "telegram", "discord", "cli").
    pub channel: String,
    /// External sender identifier (inbound) or the agent/scheduler (outbound).
    pub sender: String,
    /// Recipient on the external platform (outbound only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipient: String,
    /// Message text content.
    pub text: String,
    pub direction: Direction,
    /// Creation time (unix millis).
    pub timestamp: i64,
}

impl Envelope {
    /// Build an inbound envelope from a channel sender.
    pub fn inbound(
        channel: impl Into<String>,
        sender: impl Into<String>,
        session_key: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.into(),
            channel: channel.into(),
            sender: sender.into(),
            recipient: String::new(),
            text: text.into(),
            direction: Direction::In,
            timestamp: now_millis(),
        }
    }

    /// Build an outbound envelope addressed to `recipient` on `channel`.
    pub fn outbound(
        channel: impl Into<String>,
        recipient: impl Into<String>,
        session_key: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.into(),
            channel: channel.into(),
            sender: String::new(),
            recipient: recipient.into(),
            text: text.into(),
            direction: Direction::Out,
            timestamp: now_millis(),
        }
    }

    /// The answer to this envelope: same channel and session, addressed back to the sender.
    pub fn reply(&self, text: impl Into<String>) -> Self {
        Self::outbound(
            self.channel.clone(),
            self.sender.clone(),
            self.session_key.clone(),
            text,
        )
    }
}

/// Derive the default session key for a channel conversation.
pub fn session_key_for(channel: &str, chat_id: &str) -> String {
    format!("{channel}:{chat_id}")
}

// ──────────────────── Conversation Types ────────────────────

/// Role of a turn in a session history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned call ID, echoed back on the tool turn.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON object.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Links a tool turn to the call it answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub is_error: bool,
}

/// One role-tagged entry in a session history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Tool calls requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    /// An assistant turn that asks for tool invocations.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_result: None,
        }
    }

    /// The observed outcome of a tool call (output or error text).
    pub fn tool(call: &ToolCall, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: Some(ToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                is_error,
            }),
        }
    }
}

/// Provider-facing description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-schema-shaped parameter description.
    pub parameters: serde_json::Value,
}
