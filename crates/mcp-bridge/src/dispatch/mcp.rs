use super::ToolDispatcher;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use mcp_bridge_core::{BridgeConfig, DispatchError};
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A live MCP client session with the backend and the tools it advertised.
struct McpConnection {
    service: RunningService<RoleClient, ()>,
    tools: HashSet<String>,
    /// Advertised tools whose output schema describes a list
    sequence_tools: HashSet<String>,
}

/// Dispatches tool calls to one persistent MCP backend spoken to over stdio.
///
/// The backend is started on first use. When a call fails at the protocol
/// level the connection is dropped and the next call starts a new backend.
/// Only connecting is retried; a call is sent at most once because tools such
/// as `send_message` have side effects.
pub struct McpToolDispatcher {
    config: BridgeConfig,
    connection: Mutex<Option<Arc<McpConnection>>>,
}

impl McpToolDispatcher {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    /// Connect eagerly so a misconfigured backend is reported at startup.
    pub async fn connect(&self) -> Result<(), DispatchError> {
        self.connection().await.map(|_| ())
    }

    /// Names of the tools the current backend advertises, sorted.
    pub async fn tools(&self) -> Result<Vec<String>, DispatchError> {
        let connection = self.connection().await?;
        let mut tools: Vec<_> = connection.tools.iter().cloned().collect();
        tools.sort();
        Ok(tools)
    }

    /// Shut down the backend connection, if any.
    pub async fn close(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };
        match Arc::try_unwrap(connection) {
            Ok(connection) => {
                if let Err(e) = connection.service.cancel().await {
                    warn!(error = %e, "Failed to stop dispatch backend cleanly");
                }
            }
            // calls in flight hold the connection; it stops once they finish
            Err(_) => debug!("Dispatch connection still in use, leaving it to drop"),
        }
    }

    async fn connection(&self) -> Result<Arc<McpConnection>, DispatchError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = Arc::new(self.connect_with_retry().await?);
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn connect_with_retry(&self) -> Result<McpConnection, DispatchError> {
        let retry = &self.config.retry_config;
        if !retry.retries_enabled() {
            return self.open().await;
        }

        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(retry.min_delay())
            .with_max_delay(retry.max_delay())
            .with_max_times(retry.max_attempts.saturating_sub(1) as usize);
        if retry.jitter {
            backoff = backoff.with_jitter();
        }

        (|| self.open())
            .retry(backoff)
            .notify(|e: &DispatchError, delay| {
                warn!(error = %e, ?delay, "Connecting to dispatch backend failed, retrying");
            })
            .await
    }

    async fn open(&self) -> Result<McpConnection, DispatchError> {
        let config = &self.config;
        info!(command = %config.command, "Starting dispatch backend");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args).envs(&config.env);
        if let Some(dir) = config.working_directory() {
            cmd.current_dir(dir);
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| {
            DispatchError::Unavailable(format!("cannot start {}: {e}", config.command))
        })?;
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| DispatchError::Unavailable(format!("initialize failed: {e}")))?;

        let listed = service
            .list_tools(Default::default())
            .await
            .map_err(|e| DispatchError::Unavailable(format!("tools/list failed: {e}")))?;
        let tools: HashSet<String> = listed.tools.iter().map(|t| t.name.to_string()).collect();
        let sequence_tools: HashSet<String> = listed
            .tools
            .iter()
            .filter_map(|tool| serde_json::to_value(tool).ok())
            .filter(|tool| tool.get("outputSchema").is_some_and(describes_sequence))
            .filter_map(|tool| tool.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();

        info!(
            tools = tools.len(),
            sequence_tools = sequence_tools.len(),
            "Dispatch backend ready"
        );
        Ok(McpConnection {
            service,
            tools,
            sequence_tools,
        })
    }

    async fn discard(&self, failed: &Arc<McpConnection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            slot.take();
        }
    }
}

#[async_trait]
impl ToolDispatcher for McpToolDispatcher {
    async fn call(&self, tool: &str, arguments: Map<String, Value>) -> Result<Value, DispatchError> {
        let connection = self.connection().await?;
        if !connection.tools.contains(tool) {
            return Err(DispatchError::UnknownTool(tool.to_string()));
        }

        info!("Calling tool: {}", tool);
        let request = CallToolRequestParam {
            name: tool.to_string().into(),
            arguments: Some(arguments),
        };

        match connection.service.call_tool(request).await {
            Ok(result) => {
                let result = serde_json::to_value(&result)
                    .map_err(|e| DispatchError::Failed(format!("unreadable tool result: {e}")))?;
                let shape = if connection.sequence_tools.contains(tool)
                    || self.config.sequence_tools.iter().any(|name| name == tool)
                {
                    ResultShape::Sequence
                } else {
                    ResultShape::Single
                };
                tool_result_to_json(result, shape)
            }
            Err(e) => {
                warn!(tool, error = %e, "Tool call failed, dropping dispatch connection");
                self.discard(&connection).await;
                Err(DispatchError::Unavailable(e.to_string()))
            }
        }
    }
}

/// What a tool returns when it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// A list; answered with an array even for zero or one element
    Sequence,
    /// A single value, or a list only when the backend sent several items
    Single,
}

/// Whether an advertised output schema describes a list, either directly or
/// wrapped in the single `result` property MCP servers use for non-object
/// returns.
fn describes_sequence(schema: &Value) -> bool {
    let is_array = |schema: Option<&Value>| {
        schema.and_then(|s| s.get("type")).and_then(Value::as_str) == Some("array")
    };
    is_array(Some(schema)) || is_array(schema.pointer("/properties/result"))
}

/// Convert a serialized MCP `CallToolResult` into the JSON an HTTP caller
/// receives.
///
/// `structuredContent` wins when present, with a lone `result` wrapper
/// removed. Otherwise each text item is parsed as JSON, falling back to the
/// raw string. No items give `[]`. A `Sequence` tool always yields an array;
/// for a `Single` tool one item is returned as-is and several become an
/// array. A result flagged `isError` becomes an error carrying the text of
/// its items.
pub fn tool_result_to_json(result: Value, shape: ResultShape) -> Result<Value, DispatchError> {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = if texts.is_empty() {
            "tool reported an error".to_string()
        } else {
            texts.join("\n")
        };
        return Err(DispatchError::Failed(message));
    }

    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(match structured.as_object() {
            Some(fields) if fields.len() == 1 && fields.contains_key("result") => {
                fields["result"].clone()
            }
            _ => structured.clone(),
        });
    }

    let mut values: Vec<Value> = texts
        .into_iter()
        .map(|text| serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
        .collect();

    Ok(match (shape, values.len()) {
        (ResultShape::Single, 1) => values.remove(0),
        // a list tool that sends its whole list as one JSON array text
        (ResultShape::Sequence, 1) if values[0].is_array() => values.remove(0),
        _ => Value::Array(values),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_items(texts: &[&str]) -> Value {
        let content: Vec<Value> = texts
            .iter()
            .map(|text| json!({"type": "text", "text": text}))
            .collect();
        json!({"content": content, "isError": false})
    }

    #[test]
    fn test_text_items_become_an_array() {
        let result = text_items(&[
            r#"{"jid":"1@s.whatsapp.net","name":"Ana"}"#,
            r#"{"jid":"2@s.whatsapp.net","name":"Ben"}"#,
        ]);

        let expected = json!([
            {"jid": "1@s.whatsapp.net", "name": "Ana"},
            {"jid": "2@s.whatsapp.net", "name": "Ben"}
        ]);
        assert_eq!(tool_result_to_json(result.clone(), ResultShape::Sequence).unwrap(), expected);
        assert_eq!(tool_result_to_json(result, ResultShape::Single).unwrap(), expected);
    }

    #[test]
    fn test_list_with_one_chat_stays_an_array() {
        let result = text_items(&[r#"{"jid":"1@s.whatsapp.net","name":"Ana"}"#]);

        let value = tool_result_to_json(result, ResultShape::Sequence).unwrap();
        assert_eq!(value, json!([{"jid": "1@s.whatsapp.net", "name": "Ana"}]));
    }

    #[test]
    fn test_list_sent_as_one_array_text_is_not_nested() {
        let result = text_items(&[r#"[{"jid":"1@s.whatsapp.net"},{"jid":"2@s.whatsapp.net"}]"#]);

        let value = tool_result_to_json(result, ResultShape::Sequence).unwrap();
        assert_eq!(value, json!([{"jid": "1@s.whatsapp.net"}, {"jid": "2@s.whatsapp.net"}]));
    }

    #[test]
    fn test_no_items_is_an_empty_array() {
        for shape in [ResultShape::Sequence, ResultShape::Single] {
            let value = tool_result_to_json(text_items(&[]), shape).unwrap();
            assert_eq!(value, json!([]));
        }
    }

    #[test]
    fn test_single_item_is_returned_bare() {
        let result = text_items(&[r#"{"success":true,"message":"sent"}"#]);

        let value = tool_result_to_json(result, ResultShape::Single).unwrap();
        assert_eq!(value, json!({"success": true, "message": "sent"}));
    }

    #[test]
    fn test_plain_text_is_kept_as_string() {
        let result = text_items(&["no contacts found"]);

        let value = tool_result_to_json(result, ResultShape::Single).unwrap();
        assert_eq!(value, json!("no contacts found"));
    }

    #[test]
    fn test_structured_result_wrapper_is_removed() {
        let result = json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"result": [{"jid": "1@s.whatsapp.net"}]}
        });

        let value = tool_result_to_json(result, ResultShape::Single).unwrap();
        assert_eq!(value, json!([{"jid": "1@s.whatsapp.net"}]));
    }

    #[test]
    fn test_structured_object_is_returned_whole() {
        let result = json!({
            "content": [],
            "structuredContent": {"success": true, "message": "sent"}
        });

        let value = tool_result_to_json(result, ResultShape::Single).unwrap();
        assert_eq!(value, json!({"success": true, "message": "sent"}));
    }

    #[test]
    fn test_error_result_is_dispatch_error() {
        let result = json!({
            "content": [{"type": "text", "text": "recipient is required"}],
            "isError": true
        });

        let err = tool_result_to_json(result, ResultShape::Single).unwrap_err();
        assert!(matches!(err, DispatchError::Failed(ref m) if m == "recipient is required"));
    }

    #[test]
    fn test_non_text_items_are_skipped() {
        let result = json!({
            "content": [{"type": "image", "data": "AAAA", "mimeType": "image/png"}]
        });

        let value = tool_result_to_json(result, ResultShape::Single).unwrap();
        assert_eq!(value, json!([]));
    }

    #[test]
    fn test_output_schema_detection() {
        let wrapped = json!({
            "type": "object",
            "properties": {"result": {"type": "array", "items": {"type": "object"}}},
            "required": ["result"]
        });
        assert!(describes_sequence(&wrapped));
        assert!(describes_sequence(&json!({"type": "array"})));

        let object = json!({
            "type": "object",
            "properties": {"success": {"type": "boolean"}, "message": {"type": "string"}}
        });
        assert!(!describes_sequence(&object));
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_without_retry_loop() {
        let config = BridgeConfig::builder()
            .name("test")
            .command("/nonexistent/mcp-backend")
            .retry_config(mcp_bridge_core::RetryConfig::no_retry())
            .build()
            .unwrap();
        let dispatcher = McpToolDispatcher::new(config);

        let err = dispatcher.call("list_chats", Map::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable(_)));
    }
}
