//! Exercises the stdio transport against the bundled test server binary.

use std::collections::HashMap;
use std::ffi::OsString;
use std::time::Duration;

use mcp_types::CallToolRequest;
use mcp_types::CallToolRequestParams;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::ListToolsRequest;
use mcp_types::ListToolsRequestParams;
use mcp_types::MCP_SCHEMA_VERSION;
use onemcp_mcp_client::ClientEvent;
use onemcp_mcp_client::McpClient;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

async fn connect() -> (McpClient, mpsc::Receiver<ClientEvent>) {
    let (events_tx, events_rx) = mpsc::channel(16);
    let client = McpClient::new_stdio_client(
        OsString::from(env!("CARGO_BIN_EXE_test_stdio_server")),
        Vec::new(),
        Some(HashMap::new()),
        None,
        events_tx,
    )
    .await
    .expect("spawn test server");

    let init = client
        .initialize(
            InitializeRequestParams {
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: "stdio-client-test".to_string(),
                    version: "0.0.0".to_string(),
                    title: None,
                },
                protocol_version: MCP_SCHEMA_VERSION.to_string(),
            },
            TIMEOUT,
        )
        .await
        .expect("initialize");
    assert_eq!(init.server_info.name, "test-stdio-server");
    assert!(init.capabilities.tools.is_some());

    (client, events_rx)
}

#[tokio::test]
async fn initialize_and_paged_tool_listing() {
    let (client, _events_rx) = connect().await;

    let first = client
        .send_request::<ListToolsRequest>(None, TIMEOUT)
        .await
        .expect("first page");
    assert_eq!(first.tools.len(), 1);
    assert_eq!(first.tools[0].name, "echo");
    let cursor = first.next_cursor.expect("cursor to second page");

    let second = client
        .send_request::<ListToolsRequest>(
            Some(ListToolsRequestParams {
                cursor: Some(cursor),
            }),
            TIMEOUT,
        )
        .await
        .expect("second page");
    assert_eq!(second.tools.len(), 1);
    assert_eq!(second.tools[0].name, "add");
    assert_eq!(second.next_cursor, None);

    client.close().await;
}

#[tokio::test]
async fn tool_calls_round_trip() {
    let (client, _events_rx) = connect().await;

    let result = client
        .send_request::<CallToolRequest>(
            CallToolRequestParams {
                name: "add".to_string(),
                arguments: Some(json!({ "x": 1, "y": 2 })),
            },
            TIMEOUT,
        )
        .await
        .expect("tools/call");
    assert_eq!(result.content[0]["text"], "3");

    client.close().await;
}

#[tokio::test]
async fn server_notifications_surface_on_the_event_channel() {
    let (client, mut events_rx) = connect().await;

    // The test server emits notifications/message right after the
    // initialized notification.
    let event = tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open");
    let ClientEvent::Notification(notification) = event else {
        panic!("expected notification, got {event:?}");
    };
    assert_eq!(notification.method, "notifications/message");

    client.close().await;
}

#[tokio::test]
async fn child_exit_emits_closed() {
    let (client, mut events_rx) = connect().await;
    client.close().await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if matches!(event, ClientEvent::Closed) {
            break;
        }
    }
}
