//! `message` tool: send a message through a channel.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use clawgate_bus::{MessageBus, delivery_topic};
use clawgate_types::Envelope;

use crate::tool::{Tool, ToolContext, ToolError, parse_args};

#[derive(Debug, Deserialize)]
struct MessageArgs {
    /// Defaults to the channel the conversation came from.
    #[serde(default)]
    channel: Option<String>,
    /// Defaults to the sender of the conversation.
    #[serde(default)]
    to: Option<String>,
    text: String,
}

pub struct MessageTool {
    bus: MessageBus,
}

impl MessageTool {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to a user through a channel (Telegram, Discord, etc.). \
         Channel and recipient default to the current conversation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "channel": {
                    "type": "string",
                    "description": "Channel to send through (e.g. 'telegram')."
                },
                "to": {
                    "type": "string",
                    "description": "Recipient ID on the channel."
                },
                "text": {
                    "type": "string",
                    "description": "The message text to send."
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<String, ToolError> {
        let args: MessageArgs = parse_args(args)?;
        if args.text.trim().is_empty() {
            return Err(ToolError::InvalidArguments("text must not be empty".into()));
        }

        let channel = args
            .channel
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ctx.channel.clone());
        if channel.is_empty() {
            return Err(ToolError::InvalidArguments(
                "channel is required outside a channel conversation".into(),
            ));
        }
        let to = args
            .to
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| ctx.sender.clone());

        let envelope = Envelope::outbound(
            channel.clone(),
            to.clone(),
            ctx.session_key.clone(),
            args.text,
        );
        let routed = self.bus.publish(&delivery_topic(&channel), envelope);
        if routed == 0 {
            return Err(ToolError::Execution(format!(
                "no adapter is listening on channel '{channel}'"
            )));
        }

        tracing::info!(
            channel = %channel,
            to = %to,
            session = %ctx.session_key,
            "Message tool sent text"
        );
        Ok(format!("Message sent to {channel}:{to}"))
    }
}
