use mcp_bridge::{BridgeConfig, DispatchError, McpToolDispatcher, RetryConfig, ToolDispatcher};
use serde_json::{Map, Value, json};

const FAKE_SERVER: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/fake_mcp_server.sh"
);

fn dispatcher() -> McpToolDispatcher {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = BridgeConfig::builder()
        .name("dispatch-test")
        .command("sh")
        .args([FAKE_SERVER])
        .retry_config(RetryConfig::no_retry())
        .sequence_tools(["list_chats"])
        .build()
        .unwrap();
    McpToolDispatcher::new(config)
}

#[tokio::test]
async fn test_backend_tools_are_discovered() {
    let dispatcher = dispatcher();

    let tools = dispatcher.tools().await.unwrap();
    assert_eq!(tools, vec!["list_chats", "search_contacts", "send_message"]);

    dispatcher.close().await;
}

#[tokio::test]
async fn test_tool_call_result_is_json() {
    let dispatcher = dispatcher();
    let mut arguments = Map::new();
    arguments.insert("limit".to_string(), json!(5));

    let value = dispatcher.call("list_chats", arguments).await.unwrap();
    assert_eq!(
        value,
        json!([
            {"jid": "1@s.whatsapp.net", "name": "Ana"},
            {"jid": "2@s.whatsapp.net", "name": "Ben"}
        ])
    );

    // the same backend serves later calls
    let again = dispatcher.call("list_chats", Map::new()).await.unwrap();
    assert!(again.is_array());

    dispatcher.close().await;
}

fn limit(n: u64) -> Map<String, Value> {
    let mut arguments = Map::new();
    arguments.insert("limit".to_string(), json!(n));
    arguments
}

#[tokio::test]
async fn test_list_tool_answers_with_array_of_any_length() {
    let dispatcher = dispatcher();

    let none = dispatcher.call("list_chats", limit(0)).await.unwrap();
    assert_eq!(none, json!([]));

    let one = dispatcher.call("list_chats", limit(1)).await.unwrap();
    assert_eq!(one, json!([{"jid": "1@s.whatsapp.net", "name": "Ana"}]));

    dispatcher.close().await;
}

#[tokio::test]
async fn test_structured_list_result_is_unwrapped() {
    let dispatcher = dispatcher();

    let contacts = dispatcher.call("search_contacts", Map::new()).await.unwrap();
    assert_eq!(contacts, json!([{"jid": "1@s.whatsapp.net", "name": "Ana"}]));

    dispatcher.close().await;
}

#[tokio::test]
async fn test_tool_error_is_dispatch_failure() {
    let dispatcher = dispatcher();

    let err = dispatcher.call("send_message", Map::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Failed(ref m) if m == "recipient not found"));

    dispatcher.close().await;
}

#[tokio::test]
async fn test_unadvertised_tool_is_unknown() {
    let dispatcher = dispatcher();

    let err = dispatcher
        .call("delete_everything", Map::<String, Value>::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Unknown tool: delete_everything");

    dispatcher.close().await;
}
