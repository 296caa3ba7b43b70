//! clawgate-agent: the tool-calling agent loop.
//!
//! Provides:
//! - `Provider` trait for language-model backends
//! - `AgentLoop` with per-session serialization, a tool-iteration cap,
//!   tool/provider timeouts and cooperative cancellation
//! - Bus consumer (`AgentLoop::run`) that answers inbound envelopes on the
//!   originating channel's delivery topic
//! - `SessionManager` holding per-session conversation history

pub mod agent_loop;
pub mod error;
mod lane;
pub mod provider;
pub mod session;

pub use agent_loop::{AgentLoop, SkillsInfo, StartupInfo, ToolsInfo};
pub use error::AgentError;
pub use provider::{Completion, CompletionRequest, Provider, ProviderError};
pub use session::{Session, SessionInfo, SessionManager};
