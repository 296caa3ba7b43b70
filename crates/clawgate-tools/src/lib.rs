//! clawgate-tools: the tool contract, the tool registry and built-in tools.
//!
//! Provides:
//! - `Tool` trait, per-call `ToolContext` and `ToolError`
//! - `ToolRegistry` with duplicate-name rejection
//! - `parse_args` for typed argument validation at the tool boundary
//! - Built-in `message` tool for sending text through a channel

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{RegistryError, ToolRegistry};
pub use tool::{Tool, ToolContext, ToolError, parse_args};
