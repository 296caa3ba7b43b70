//! Language-model provider contract.
//!
//! Concrete backends (OpenRouter, Anthropic, OpenAI, local servers) live
//! outside this crate and implement [`Provider`].

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use clawgate_types::{ToolCall, ToolSchema, Turn};

/// Everything a provider needs for one round.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system_prompt: Option<&'a str>,
    /// Full session history, oldest first.
    pub turns: &'a [Turn],
    /// Tools the model may call.
    pub tools: &'a [ToolSchema],
}

/// What the model answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// A final textual answer.
    Final(String),
    /// One or more tool invocations, with whatever text came alongside them.
    ToolCalls { content: String, calls: Vec<ToolCall> },
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Cancelled")]
    Cancelled,
}

/// A language-model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier used in logs (e.g. "openrouter").
    fn name(&self) -> &str;

    /// Run one completion round. Implementations must stop promptly once
    /// `cancel` fires and report [`ProviderError::Cancelled`].
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Completion, ProviderError>;
}
