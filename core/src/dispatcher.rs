//! Request dispatcher: routes every inbound MCP request to the correct
//! outbound client(s).
//!
//! Four patterns exist. Addressed requests carry a composite id and go to
//! exactly one server. List requests fan out across the filtered set, either
//! draining every server (pagination disabled) or one page at a time behind a
//! cross-server cursor. Notifications broadcast. `logging/setLevel` and
//! sampling have their own paths.
//!
//! Within one inbound request, per-server sub-requests run concurrently but
//! results are always assembled in server name order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use mcp_types::CallToolRequestParams;
use mcp_types::GetPromptRequestParams;
use mcp_types::JSONRPCMessage;
use mcp_types::ListPromptsResult;
use mcp_types::ListResourceTemplatesResult;
use mcp_types::ListResourcesResult;
use mcp_types::ListToolsResult;
use mcp_types::Prompt;
use mcp_types::ReadResourceRequestParams;
use mcp_types::Resource;
use mcp_types::ResourceTemplate;
use mcp_types::SetLevelRequestParams;
use mcp_types::SubscribeRequestParams;
use mcp_types::Tool;
use mcp_types::UnsubscribeRequestParams;
use serde_json::Value;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::warn;

use crate::capabilities::CapabilityCategory;
use crate::error::ProxyError;
use crate::filter::FilterContext;
use crate::naming::compose_id;
use crate::naming::parse_id;
use crate::outbound::ClientStatus;
use crate::outbound::OutboundConnection;
use crate::outbound::OutboundManager;
use crate::pagination::decode_cursor;
use crate::pagination::encode_cursor;
use crate::retry::RetryOptions;
use crate::retry::run_with_retry;

/// Everything the dispatcher needs to know about the inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub filter: FilterContext,
    /// Cross-server pagination on list requests (`pagination=true`).
    pub pagination: bool,
    pub retry: RetryOptions,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>, filter: FilterContext) -> Self {
        Self {
            session_id: session_id.into(),
            filter,
            pagination: false,
            retry: RetryOptions::default(),
        }
    }
}

/// A list category the dispatcher can fan out over.
trait ListKind: Send + 'static {
    type Item: Send + 'static;
    const OPERATION: &'static str;
    const CATEGORY: CapabilityCategory;

    fn params(cursor: Option<&str>) -> Value;
    fn parse(result: Value) -> Result<(Vec<Self::Item>, Option<String>), ProxyError>;
    fn rewrite(item: Self::Item, server: &str) -> Self::Item;
}

fn cursor_params(cursor: Option<&str>) -> Value {
    match cursor {
        Some(cursor) => json!({ "cursor": cursor }),
        None => Value::Null,
    }
}

fn parse_list_result<T: serde::de::DeserializeOwned>(
    operation: &str,
    result: Value,
) -> Result<T, ProxyError> {
    serde_json::from_value(result).map_err(|err| {
        ProxyError::internal(format!("malformed `{operation}` result from server: {err}"))
    })
}

struct ToolsList;

impl ListKind for ToolsList {
    type Item = Tool;
    const OPERATION: &'static str = "tools/list";
    const CATEGORY: CapabilityCategory = CapabilityCategory::Tools;

    fn params(cursor: Option<&str>) -> Value {
        cursor_params(cursor)
    }

    fn parse(result: Value) -> Result<(Vec<Tool>, Option<String>), ProxyError> {
        let parsed: ListToolsResult = parse_list_result(Self::OPERATION, result)?;
        Ok((parsed.tools, parsed.next_cursor))
    }

    fn rewrite(mut item: Tool, server: &str) -> Tool {
        item.name = compose_id(server, &item.name);
        item
    }
}

struct ResourcesList;

impl ListKind for ResourcesList {
    type Item = Resource;
    const OPERATION: &'static str = "resources/list";
    const CATEGORY: CapabilityCategory = CapabilityCategory::Resources;

    fn params(cursor: Option<&str>) -> Value {
        cursor_params(cursor)
    }

    fn parse(result: Value) -> Result<(Vec<Resource>, Option<String>), ProxyError> {
        let parsed: ListResourcesResult = parse_list_result(Self::OPERATION, result)?;
        Ok((parsed.resources, parsed.next_cursor))
    }

    fn rewrite(mut item: Resource, server: &str) -> Resource {
        item.uri = compose_id(server, &item.uri);
        item
    }
}

struct ResourceTemplatesList;

impl ListKind for ResourceTemplatesList {
    type Item = ResourceTemplate;
    const OPERATION: &'static str = "resources/templates/list";
    const CATEGORY: CapabilityCategory = CapabilityCategory::Resources;

    fn params(cursor: Option<&str>) -> Value {
        cursor_params(cursor)
    }

    fn parse(result: Value) -> Result<(Vec<ResourceTemplate>, Option<String>), ProxyError> {
        let parsed: ListResourceTemplatesResult = parse_list_result(Self::OPERATION, result)?;
        Ok((parsed.resource_templates, parsed.next_cursor))
    }

    fn rewrite(mut item: ResourceTemplate, server: &str) -> ResourceTemplate {
        item.uri_template = compose_id(server, &item.uri_template);
        item
    }
}

struct PromptsList;

impl ListKind for PromptsList {
    type Item = Prompt;
    const OPERATION: &'static str = "prompts/list";
    const CATEGORY: CapabilityCategory = CapabilityCategory::Prompts;

    fn params(cursor: Option<&str>) -> Value {
        cursor_params(cursor)
    }

    fn parse(result: Value) -> Result<(Vec<Prompt>, Option<String>), ProxyError> {
        let parsed: ListPromptsResult = parse_list_result(Self::OPERATION, result)?;
        Ok((parsed.prompts, parsed.next_cursor))
    }

    fn rewrite(mut item: Prompt, server: &str) -> Prompt {
        item.name = compose_id(server, &item.name);
        item
    }
}

pub struct Dispatcher {
    manager: Arc<OutboundManager>,
    /// Per outbound server, the inbound session that most recently addressed
    /// it. Sampling requests from that server route back there.
    sampling_origin: Mutex<HashMap<String, String>>,
}

impl Dispatcher {
    pub fn new(manager: Arc<OutboundManager>) -> Self {
        Self {
            manager,
            sampling_origin: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<OutboundManager> {
        &self.manager
    }

    /// The filtered outbound subset in deterministic name order.
    fn selected(&self, ctx: &RequestContext) -> Vec<Arc<OutboundConnection>> {
        self.manager
            .connections()
            .values()
            .filter(|conn| ctx.filter.admits(conn.tags()))
            .cloned()
            .collect()
    }

    /// Whether a session filter currently admits the named outbound server.
    pub fn filter_admits(&self, filter: &FilterContext, server: &str) -> bool {
        self.manager
            .connection(server)
            .map(|conn| filter.admits(conn.tags()))
            .unwrap_or(false)
    }

    /// The inbound session that originated the most recent call addressed to
    /// `server`, if any. Used to route sampling requests back.
    pub fn sampling_target(&self, server: &str) -> Option<String> {
        let guard = match self.sampling_origin.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.get(server).cloned()
    }

    fn record_origin(&self, server: &str, session: &str) {
        let mut guard = match self.sampling_origin.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.insert(server.to_string(), session.to_string());
    }

    // -----------------------------------------------------------------------
    // Addressed requests
    // -----------------------------------------------------------------------

    pub async fn call_tool(
        &self,
        ctx: &RequestContext,
        params: CallToolRequestParams,
    ) -> Result<Value, ProxyError> {
        let (server, tool) = parse_id(&params.name)?;
        let conn = self.addressed(ctx, server, CapabilityCategory::Tools)?;
        self.record_origin(server, &ctx.session_id);
        let request = mcp_types::CallToolRequestParams {
            name: tool.to_string(),
            arguments: params.arguments,
        };
        self.raw_call(ctx, &conn, "tools/call", serde_json::to_value(request)?)
            .await
    }

    pub async fn read_resource(
        &self,
        ctx: &RequestContext,
        params: ReadResourceRequestParams,
    ) -> Result<Value, ProxyError> {
        let (server, uri) = parse_id(&params.uri)?;
        let conn = self.addressed(ctx, server, CapabilityCategory::Resources)?;
        self.record_origin(server, &ctx.session_id);
        self.raw_call(ctx, &conn, "resources/read", json!({ "uri": uri }))
            .await
    }

    pub async fn get_prompt(
        &self,
        ctx: &RequestContext,
        params: GetPromptRequestParams,
    ) -> Result<Value, ProxyError> {
        let (server, prompt) = parse_id(&params.name)?;
        let conn = self.addressed(ctx, server, CapabilityCategory::Prompts)?;
        self.record_origin(server, &ctx.session_id);
        let request = GetPromptRequestParams {
            name: prompt.to_string(),
            arguments: params.arguments,
        };
        self.raw_call(ctx, &conn, "prompts/get", serde_json::to_value(request)?)
            .await
    }

    pub async fn subscribe_resource(
        &self,
        ctx: &RequestContext,
        params: SubscribeRequestParams,
    ) -> Result<Value, ProxyError> {
        let (server, uri) = parse_id(&params.uri)?;
        let conn = self.addressed(ctx, server, CapabilityCategory::Resources)?;
        self.raw_call(ctx, &conn, "resources/subscribe", json!({ "uri": uri }))
            .await
    }

    pub async fn unsubscribe_resource(
        &self,
        ctx: &RequestContext,
        params: UnsubscribeRequestParams,
    ) -> Result<Value, ProxyError> {
        let (server, uri) = parse_id(&params.uri)?;
        let conn = self.addressed(ctx, server, CapabilityCategory::Resources)?;
        self.raw_call(ctx, &conn, "resources/unsubscribe", json!({ "uri": uri }))
            .await
    }

    /// `completion/complete` addresses the server named inside the prompt or
    /// resource reference; the inner id is substituted before forwarding.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        mut params: Value,
    ) -> Result<Value, ProxyError> {
        let reference = params
            .get("ref")
            .ok_or_else(|| ProxyError::invalid_request("missing `ref`"))?;
        let ref_type = reference
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let key = match ref_type {
            "ref/prompt" => "name",
            "ref/resource" => "uri",
            other => {
                return Err(ProxyError::invalid_request(format!(
                    "unsupported completion reference type `{other}`"
                )));
            }
        };
        let composite = reference
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProxyError::invalid_request(format!("missing `ref.{key}`"))
            })?;
        let (server, inner) = parse_id(composite)?;
        let (server, inner) = (server.to_string(), inner.to_string());

        let conn = self.addressed(ctx, &server, CapabilityCategory::Completions)?;
        self.record_origin(&server, &ctx.session_id);
        if let Some(obj) = params.get_mut("ref").and_then(Value::as_object_mut) {
            obj.insert(key.to_string(), Value::String(inner));
        }
        self.raw_call(ctx, &conn, "completion/complete", params).await
    }

    /// Resolve the target of an addressed request: the name must be known,
    /// admitted by the session filter, connected, and support the category.
    fn addressed(
        &self,
        ctx: &RequestContext,
        server: &str,
        category: CapabilityCategory,
    ) -> Result<Arc<OutboundConnection>, ProxyError> {
        let conn = self
            .manager
            .connection(server)
            .filter(|conn| ctx.filter.admits(conn.tags()))
            .ok_or_else(|| ProxyError::ClientNotFound {
                name: server.to_string(),
            })?;
        if conn.status() != ClientStatus::Connected {
            return Err(ProxyError::ClientConnection {
                name: server.to_string(),
                message: format!("server is {:?}", conn.status()),
            });
        }
        if !has_capability(&conn, category) {
            return Err(ProxyError::CapabilityNotSupported {
                name: server.to_string(),
                capability: category.key().to_string(),
            });
        }
        Ok(conn)
    }

    // One outbound request with the per-request retry policy applied.
    // Protocol-level errors surface unchanged; transport errors retry.
    async fn raw_call(
        &self,
        ctx: &RequestContext,
        conn: &Arc<OutboundConnection>,
        method: &str,
        params: Value,
    ) -> Result<Value, ProxyError> {
        let operation = format!("{method} -> {}", conn.name);
        run_with_retry(&operation, ctx.retry, || {
            fetch_raw(Arc::clone(conn), method.to_string(), params.clone())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // List requests
    // -----------------------------------------------------------------------

    pub async fn list_tools(
        &self,
        ctx: &RequestContext,
        cursor: Option<String>,
    ) -> Result<ListToolsResult, ProxyError> {
        let (tools, next_cursor) = self.fan_out_list::<ToolsList>(ctx, cursor).await?;
        Ok(ListToolsResult { tools, next_cursor })
    }

    pub async fn list_resources(
        &self,
        ctx: &RequestContext,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, ProxyError> {
        let (resources, next_cursor) = self.fan_out_list::<ResourcesList>(ctx, cursor).await?;
        Ok(ListResourcesResult {
            resources,
            next_cursor,
        })
    }

    pub async fn list_resource_templates(
        &self,
        ctx: &RequestContext,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult, ProxyError> {
        let (resource_templates, next_cursor) =
            self.fan_out_list::<ResourceTemplatesList>(ctx, cursor).await?;
        Ok(ListResourceTemplatesResult {
            resource_templates,
            next_cursor,
        })
    }

    pub async fn list_prompts(
        &self,
        ctx: &RequestContext,
        cursor: Option<String>,
    ) -> Result<ListPromptsResult, ProxyError> {
        let (prompts, next_cursor) = self.fan_out_list::<PromptsList>(ctx, cursor).await?;
        Ok(ListPromptsResult {
            prompts,
            next_cursor,
        })
    }

    async fn fan_out_list<K: ListKind>(
        &self,
        ctx: &RequestContext,
        cursor: Option<String>,
    ) -> Result<(Vec<K::Item>, Option<String>), ProxyError> {
        let servers = self.selected(ctx);
        if ctx.pagination {
            self.list_one_page::<K>(ctx, &servers, cursor).await
        } else {
            Ok(Self::drain_all::<K>(ctx, &servers).await)
        }
    }

    /// Pagination disabled: drain every eligible server concurrently,
    /// assemble in name order. A failing server is logged and contributes
    /// nothing; the rest of the response stands.
    async fn drain_all<K: ListKind>(
        ctx: &RequestContext,
        servers: &[Arc<OutboundConnection>],
    ) -> (Vec<K::Item>, Option<String>) {
        let mut join_set: JoinSet<(String, Result<Vec<K::Item>, ProxyError>)> = JoinSet::new();
        for conn in servers {
            if !eligible::<K>(conn) {
                continue;
            }
            let conn = Arc::clone(conn);
            let retry = ctx.retry;
            join_set.spawn(async move {
                let name = conn.name.clone();
                let result = drain_server::<K>(conn, retry).await;
                (name, result)
            });
        }

        let mut by_server: BTreeMap<String, Vec<K::Item>> = BTreeMap::new();
        while let Some(join_res) = join_set.join_next().await {
            match join_res {
                Ok((name, Ok(items))) => {
                    by_server.insert(name, items);
                }
                Ok((name, Err(err))) => {
                    warn!("`{}` failed for `{name}`: {err}", K::OPERATION);
                }
                Err(err) => {
                    warn!("`{}` task panicked: {err:#}", K::OPERATION);
                }
            }
        }

        let items = by_server.into_values().flatten().collect();
        (items, None)
    }

    /// Pagination enabled: serve one page from one server and hand back a
    /// cursor pointing either at that server's next page or at the next
    /// server in filter order.
    async fn list_one_page<K: ListKind>(
        &self,
        ctx: &RequestContext,
        servers: &[Arc<OutboundConnection>],
        cursor: Option<String>,
    ) -> Result<(Vec<K::Item>, Option<String>), ProxyError> {
        let (mut index, mut inner) = match cursor.as_deref().and_then(decode_cursor) {
            Some((name, inner)) => match servers.iter().position(|c| c.name == name) {
                Some(index) => (index, inner),
                // The cursor references a server that left the filtered set:
                // start over.
                None => (0, String::new()),
            },
            // Absent or malformed cursor: start from the first server.
            None => {
                if cursor.is_some() {
                    debug!("malformed cursor; starting from the first server");
                }
                (0, String::new())
            }
        };

        loop {
            let Some(conn) = servers.get(index) else {
                return Ok((Vec::new(), None));
            };
            if !eligible::<K>(conn) {
                index += 1;
                inner.clear();
                continue;
            }

            let page_cursor = if inner.is_empty() {
                None
            } else {
                Some(inner.clone())
            };
            let result = run_with_retry(K::OPERATION, ctx.retry, || {
                fetch_page::<K>(Arc::clone(conn), page_cursor.clone())
            })
            .await?;
            let (items, next_inner) = result;
            let items = items
                .into_iter()
                .map(|item| K::rewrite(item, &conn.name))
                .collect();

            let next_cursor = match next_inner {
                Some(next) => Some(encode_cursor(&conn.name, &next)),
                None => servers
                    .get(index + 1)
                    .map(|next_conn| encode_cursor(&next_conn.name, "")),
            };
            return Ok((items, next_cursor));
        }
    }

    // -----------------------------------------------------------------------
    // Notifications, logging, ping
    // -----------------------------------------------------------------------

    /// Deliver a client-to-server notification to every connected outbound
    /// client. Disconnected transports drop the notification with a warning.
    pub async fn broadcast_notification(&self, method: &str, params: Value) {
        for (name, conn) in self.manager.connections().iter() {
            let Some(client) = connected_client(conn) else {
                warn!("dropping notification `{method}` for disconnected server `{name}`");
                continue;
            };
            if let Err(err) = client.send_raw_notification(method, params.clone()).await {
                warn!("failed to forward notification `{method}` to `{name}`: {err:#}");
            }
        }
    }

    /// `logging/setLevel` broadcasts to all connected outbound clients.
    /// Individual failures are logged; the inbound caller gets an empty
    /// result either way.
    pub async fn set_level(&self, params: SetLevelRequestParams) -> Value {
        let params = match serde_json::to_value(&params) {
            Ok(value) => value,
            Err(_) => Value::Null,
        };
        let mut join_set = JoinSet::new();
        for (name, conn) in self.manager.connections().iter() {
            let Some(client) = connected_client(conn) else {
                continue;
            };
            let name = name.clone();
            let params = params.clone();
            let timeout = conn.request_timeout();
            join_set.spawn(async move {
                if let Err(err) = client
                    .send_raw_request("logging/setLevel", params, Some(timeout))
                    .await
                {
                    warn!("logging/setLevel failed for `{name}`: {err:#}");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        json!({})
    }

    /// `ping` is answered locally; the federation is not consulted.
    pub fn ping(&self) -> Value {
        json!({})
    }
}

fn has_capability(conn: &OutboundConnection, category: CapabilityCategory) -> bool {
    let Some(caps) = conn.capabilities() else {
        return false;
    };
    let value = serde_json::to_value(&caps).unwrap_or(Value::Null);
    value.get(category.key()).is_some()
}

fn eligible<K: ListKind>(conn: &OutboundConnection) -> bool {
    conn.status() == ClientStatus::Connected && has_capability(conn, K::CATEGORY)
}

fn connected_client(conn: &OutboundConnection) -> Option<Arc<onemcp_mcp_client::McpClient>> {
    if conn.status() != ClientStatus::Connected {
        return None;
    }
    conn.client()
}

/// One raw request against one server, with transport errors typed.
async fn fetch_raw(
    conn: Arc<OutboundConnection>,
    method: String,
    params: Value,
) -> Result<Value, ProxyError> {
    let client = conn.client().ok_or_else(|| ProxyError::ClientConnection {
        name: conn.name.clone(),
        message: "no transport".to_string(),
    })?;
    let timeout = conn.request_timeout();
    match client.send_raw_request(&method, params, Some(timeout)).await {
        Ok(JSONRPCMessage::Response(resp)) => Ok(resp.result),
        Ok(JSONRPCMessage::Error(err)) => Err(ProxyError::Protocol(err.error)),
        Ok(other) => Err(ProxyError::internal(format!(
            "unexpected reply variant from `{}`: {other:?}",
            conn.name
        ))),
        Err(err) => {
            let message = format!("{err:#}");
            if message.contains("request timed out") {
                Err(ProxyError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            } else {
                Err(ProxyError::Transport {
                    name: conn.name.clone(),
                    message,
                })
            }
        }
    }
}

async fn fetch_page<K: ListKind>(
    conn: Arc<OutboundConnection>,
    cursor: Option<String>,
) -> Result<(Vec<K::Item>, Option<String>), ProxyError> {
    let params = K::params(cursor.as_deref());
    let result = fetch_raw(conn, K::OPERATION.to_string(), params).await?;
    K::parse(result)
}

/// Follow a single server's own pagination to the end, rewriting ids along
/// the way. A server that returns the same cursor twice is broken; bail
/// instead of looping forever.
async fn drain_server<K: ListKind>(
    conn: Arc<OutboundConnection>,
    retry: RetryOptions,
) -> Result<Vec<K::Item>, ProxyError> {
    let mut collected: Vec<K::Item> = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page_cursor = cursor.clone();
        let (items, next) = run_with_retry(K::OPERATION, retry, || {
            fetch_page::<K>(Arc::clone(&conn), page_cursor.clone())
        })
        .await?;
        collected.extend(items.into_iter().map(|item| K::rewrite(item, &conn.name)));

        match next {
            Some(next) => {
                if cursor.as_ref() == Some(&next) {
                    return Err(ProxyError::internal(format!(
                        "`{}` returned a duplicate cursor for `{}`",
                        conn.name,
                        K::OPERATION
                    )));
                }
                cursor = Some(next);
            }
            None => return Ok(collected),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn tools_rewrite_prefixes_the_name() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "add",
            "inputSchema": { "type": "object" }
        }))
        .expect("tool");
        let rewritten = ToolsList::rewrite(tool, "math");
        assert_eq!(rewritten.name, "math_1mcp_add");
    }

    #[test]
    fn resources_rewrite_prefixes_the_uri() {
        let resource: Resource = serde_json::from_value(json!({
            "uri": "file:///tmp/a.txt",
            "name": "a"
        }))
        .expect("resource");
        let rewritten = ResourcesList::rewrite(resource, "files");
        assert_eq!(rewritten.uri, "files_1mcp_file:///tmp/a.txt");
        assert_eq!(rewritten.name, "a");
    }

    #[test]
    fn prompt_and_template_rewrites() {
        let prompt: Prompt =
            serde_json::from_value(json!({ "name": "greet" })).expect("prompt");
        assert_eq!(PromptsList::rewrite(prompt, "p").name, "p_1mcp_greet");

        let template: ResourceTemplate = serde_json::from_value(json!({
            "uriTemplate": "file:///{path}",
            "name": "files"
        }))
        .expect("template");
        assert_eq!(
            ResourceTemplatesList::rewrite(template, "fs").uri_template,
            "fs_1mcp_file:///{path}"
        );
    }

    #[test]
    fn cursor_params_shape() {
        assert_eq!(ToolsList::params(None), Value::Null);
        assert_eq!(ToolsList::params(Some("p2")), json!({ "cursor": "p2" }));
    }

    #[test]
    fn parse_accepts_results_without_cursor() {
        let (tools, next) = ToolsList::parse(json!({
            "tools": [ { "name": "x", "inputSchema": {} } ]
        }))
        .expect("parse");
        assert_eq!(tools.len(), 1);
        assert_eq!(next, None);
    }

    #[test]
    fn parse_rejects_malformed_results() {
        assert!(ToolsList::parse(json!({ "tools": "nope" })).is_err());
    }
}
