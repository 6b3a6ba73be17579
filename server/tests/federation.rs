//! End-to-end federation scenarios: addressed calls, fan-out listing,
//! cross-server cursors, the self-loop guard, and catalog hot-reload.
//!
//! Outbound servers are real child processes running the
//! `test_stdio_server` binary from the client crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use onemcp_core::outbound::ClientStatus;
use onemcp_server::http;
use onemcp_server::proxy::ProxyState;
use onemcp_server::proxy::spawn_event_loops;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;

/// Path of the stdio test server built alongside the client crate. Tests run
/// from `target/<profile>/deps/…`, so the binary sits two levels up.
fn test_server_bin() -> PathBuf {
    let mut path = std::env::current_exe().expect("current exe");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("test_stdio_server");
    assert!(
        path.exists(),
        "test_stdio_server not built at {}",
        path.display()
    );
    path
}

fn stdio_entry(tags: &[&str]) -> Value {
    json!({
        "type": "stdio",
        "command": test_server_bin().to_string_lossy(),
        "tags": tags,
    })
}

struct TestProxy {
    base: String,
    client: reqwest::Client,
    state: Arc<ProxyState>,
    catalog_path: PathBuf,
    _config_dir: tempfile::TempDir,
}

impl TestProxy {
    async fn start(servers: Value) -> Self {
        let config_dir = tempfile::tempdir().expect("tempdir");
        let catalog_path = config_dir.path().join("mcp.json");
        std::fs::write(
            &catalog_path,
            json!({ "mcpServers": servers }).to_string(),
        )
        .expect("write catalog");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let (state, events_rx) = ProxyState::bootstrap(
            config_dir.path().to_path_buf(),
            catalog_path.clone(),
            false,
            format!("http://{addr}"),
        )
        .await
        .expect("bootstrap");
        spawn_event_loops(Arc::clone(&state), events_rx);

        let router = http::build_router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("serve");
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            state,
            catalog_path,
            _config_dir: config_dir,
        }
    }

    /// POST one JSON-RPC request; returns the reply body and the session id.
    async fn post(
        &self,
        query: &str,
        session: Option<&str>,
        body: Value,
    ) -> (Value, String) {
        let mut request = self
            .client
            .post(format!("{}/mcp{query}", self.base))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(session) = session {
            request = request.header("mcp-session-id", session);
        }
        let response = request.send().await.expect("post /mcp");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let session_id = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| session.map(str::to_string))
            .expect("session id");
        let body: Value = response.json().await.expect("reply body");
        (body, session_id)
    }

    async fn initialize(&self, query: &str) -> String {
        let (reply, session) = self
            .post(
                query,
                None,
                json!({
                    "jsonrpc": "2.0",
                    "id": 0,
                    "method": "initialize",
                    "params": {
                        "capabilities": {},
                        "clientInfo": { "name": "federation-test", "version": "0" },
                        "protocolVersion": "2025-06-18"
                    }
                }),
            )
            .await;
        assert_eq!(reply["result"]["serverInfo"]["name"], "1mcp");
        session
    }

    fn tool_names(reply: &Value) -> Vec<String> {
        reply["result"]["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .map(|tool| tool["name"].as_str().expect("tool name").to_string())
            .collect()
    }
}

#[tokio::test]
async fn health_reports_per_server_status() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&["alpha"]),
    }))
    .await;

    let body: Value = proxy
        .client
        .get(format!("{}/health", proxy.base))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["servers"][0]["name"], "a");
    assert_eq!(body["servers"][0]["status"], "connected");
    assert_eq!(body["servers"][0]["tags"][0], "alpha");
}

#[tokio::test]
async fn addressed_tool_call_reaches_only_its_server() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&["alpha"]),
        "b": stdio_entry(&["beta"]),
    }))
    .await;
    let session = proxy.initialize("").await;

    let (reply, _) = proxy
        .post(
            "",
            Some(&session),
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": { "name": "b_1mcp_add", "arguments": { "x": 1, "y": 2 } }
            }),
        )
        .await;
    assert_eq!(reply["result"]["content"][0]["text"], "3");
}

#[tokio::test]
async fn fan_out_list_without_pagination_concatenates_in_name_order() {
    let proxy = TestProxy::start(json!({
        "b": stdio_entry(&[]),
        "a": stdio_entry(&[]),
    }))
    .await;
    let session = proxy.initialize("").await;

    let (reply, _) = proxy
        .post(
            "",
            Some(&session),
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await;
    assert_eq!(
        TestProxy::tool_names(&reply),
        ["a_1mcp_echo", "a_1mcp_add", "b_1mcp_echo", "b_1mcp_add"]
    );
    assert!(reply["result"]["nextCursor"].is_null());
}

#[tokio::test]
async fn cross_server_cursor_walks_the_federation() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&[]),
        "b": stdio_entry(&[]),
    }))
    .await;
    let session = proxy.initialize("?pagination=true").await;

    let list = |cursor: Option<String>| {
        let proxy = &proxy;
        let session = session.clone();
        async move {
            let params = match cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let (reply, _) = proxy
                .post(
                    "",
                    Some(&session),
                    json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "method": "tools/list",
                        "params": params
                    }),
                )
                .await;
            let names = TestProxy::tool_names(&reply);
            let next = reply["result"]["nextCursor"].as_str().map(str::to_string);
            (names, next)
        }
    };

    let (names, next) = list(None).await;
    assert_eq!(names, ["a_1mcp_echo"]);
    assert_eq!(next.as_deref(), Some(BASE64.encode("a:p2").as_str()));

    let (names, next) = list(next).await;
    assert_eq!(names, ["a_1mcp_add"]);
    assert_eq!(next.as_deref(), Some(BASE64.encode("b:").as_str()));

    let (names, next) = list(next).await;
    assert_eq!(names, ["b_1mcp_echo"]);
    assert_eq!(next.as_deref(), Some(BASE64.encode("b:p2").as_str()));

    let (names, next) = list(next).await;
    assert_eq!(names, ["b_1mcp_add"]);
    assert_eq!(next, None);

    // A garbage cursor restarts from the first server.
    let (names, _) = list(Some("!!garbage!!".to_string())).await;
    assert_eq!(names, ["a_1mcp_echo"]);
}

#[tokio::test]
async fn paginated_walk_equals_drained_result() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&[]),
        "b": stdio_entry(&[]),
    }))
    .await;

    let drained_session = proxy.initialize("").await;
    let (reply, _) = proxy
        .post(
            "",
            Some(&drained_session),
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await;
    let drained = TestProxy::tool_names(&reply);

    let paged_session = proxy.initialize("?pagination=true").await;
    let mut walked = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = match &cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let (reply, _) = proxy
            .post(
                "",
                Some(&paged_session),
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "tools/list",
                    "params": params
                }),
            )
            .await;
        walked.extend(TestProxy::tool_names(&reply));
        cursor = reply["result"]["nextCursor"].as_str().map(str::to_string);
        if cursor.is_none() {
            break;
        }
    }

    assert_eq!(walked, drained);
}

#[tokio::test]
async fn tag_filter_selects_the_outbound_subset() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&["alpha"]),
        "b": stdio_entry(&["beta"]),
    }))
    .await;
    let session = proxy.initialize("?tags=beta").await;

    let (reply, _) = proxy
        .post(
            "",
            Some(&session),
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await;
    assert_eq!(
        TestProxy::tool_names(&reply),
        ["b_1mcp_echo", "b_1mcp_add"]
    );

    // The filtered-out server is invisible to addressed calls too.
    let (reply, _) = proxy
        .post(
            "",
            Some(&session),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "a_1mcp_echo", "arguments": { "text": "hi" } }
            }),
        )
        .await;
    assert_eq!(reply["error"]["code"], -32001);
}

#[tokio::test]
async fn self_loop_ends_in_error_and_leaves_peers_healthy() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&[]),
    }))
    .await;

    // Point a new catalog entry at the proxy itself; the watcher picks the
    // rewrite up and reconciles in the background.
    std::fs::write(
        &proxy.catalog_path,
        json!({
            "mcpServers": {
                "a": stdio_entry(&[]),
                "selfloop": { "type": "http", "url": format!("{}/mcp", proxy.base) }
            }
        })
        .to_string(),
    )
    .expect("rewrite catalog");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(conn) = proxy.state.manager.connection("selfloop") {
            if conn.status() == ClientStatus::Error {
                let error = conn.state().last_error.expect("error message");
                assert!(
                    error.contains("circular dependency"),
                    "unexpected error: {error}"
                );
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "selfloop never reached Error"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let healthy = proxy.state.manager.connection("a").expect("record");
    assert_eq!(healthy.status(), ClientStatus::Connected);
}

#[tokio::test]
async fn catalog_reload_connects_new_servers_within_the_debounce_window() {
    let proxy = TestProxy::start(json!({
        "a": stdio_entry(&[]),
    }))
    .await;
    let session = proxy.initialize("").await;

    std::fs::write(
        &proxy.catalog_path,
        json!({
            "mcpServers": {
                "a": stdio_entry(&[]),
                "c": stdio_entry(&[]),
            }
        })
        .to_string(),
    )
    .expect("rewrite catalog");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(conn) = proxy.state.manager.connection("c") {
            if conn.status() == ClientStatus::Connected {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server `c` never connected after the catalog reload"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (reply, _) = proxy
        .post(
            "",
            Some(&session),
            json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
        )
        .await;
    assert_eq!(
        TestProxy::tool_names(&reply),
        ["a_1mcp_echo", "a_1mcp_add", "c_1mcp_echo", "c_1mcp_add"]
    );
}
