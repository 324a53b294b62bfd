//! Tool dispatch for the transactional HTTP listener.

mod mcp;

pub use mcp::{McpToolDispatcher, ResultShape, tool_result_to_json};

use async_trait::async_trait;
use mcp_bridge_core::DispatchError;
use serde_json::{Map, Value};

/// Performs one named tool call and returns its JSON result.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call(&self, tool: &str, arguments: Map<String, Value>) -> Result<Value, DispatchError>;
}
