//! mcp-bridge - expose a stdio MCP server over the network
//!
//! Each TCP (or stdio) client gets its own backend process and a transparent
//! byte relay to it. The HTTP listener instead turns one JSON request into
//! one tool call against a shared backend.

#[cfg(not(unix))]
compile_error!("mcp-bridge currently supports Unix platforms only");

pub mod dispatch;
pub mod http;
pub mod launcher;
pub mod logging;
pub mod probe;
pub mod session;
pub mod stdio;
pub mod tcp;

pub use dispatch::{McpToolDispatcher, ToolDispatcher};
pub use launcher::{BackendLauncher, BackendProcess};
pub use session::Bridge;

// Re-export core functionality
pub use mcp_bridge_core::*;
