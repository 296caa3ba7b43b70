//! Built-in tools that only need gateway plumbing.

pub mod message;

pub use message::MessageTool;
