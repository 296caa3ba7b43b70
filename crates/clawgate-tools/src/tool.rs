//! The tool contract shared by every capability the agent can call.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use clawgate_types::ToolSchema;

/// Errors a tool call can produce.
///
/// None of these abort the conversation: the agent loop records the error
/// text as a tool turn so the provider can react to it.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Session the call belongs to.
    pub session_key: String,
    /// Channel the conversation came from (empty for direct calls).
    pub channel: String,
    /// External sender of the conversation (empty for direct calls).
    pub sender: String,
    /// Cancelled when the owning processing call is aborted.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_key: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_key: session_key.into(),
            channel: String::new(),
            sender: String::new(),
            cancel,
        }
    }

    /// Attach the conversation origin.
    pub fn with_origin(mut self, channel: impl Into<String>, sender: impl Into<String>) -> Self {
        self.channel = channel.into();
        self.sender = sender.into();
        self
    }
}

/// A named, schema-described capability the agent can invoke mid-conversation.
///
/// Implementations validate their own arguments (see [`parse_args`]) and must
/// honor `ctx.cancel` at their await points.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// What the tool does, shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Execute the tool.
    async fn execute(&self, ctx: &ToolContext, args: Map<String, Value>)
    -> Result<String, ToolError>;

    /// Provider-facing description.
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Deserialize raw tool arguments into a typed struct.
pub fn parse_args<T: DeserializeOwned>(args: Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}
