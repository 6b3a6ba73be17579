//! Inbound HTTP multiplexer.
//!
//! Two MCP transports share one axum router:
//! - streamable HTTP: `POST /mcp` carries a message (the reply comes back in
//!   the response body), `GET /mcp` opens the server-to-client event stream,
//!   `DELETE /mcp` ends the session. The session id rides in the
//!   `mcp-session-id` header; the first POST without one allocates it.
//! - legacy SSE: `GET /sse` opens the stream (the initial `endpoint` event
//!   names the message URL), `POST /messages?sessionId=…` submits messages
//!   and gets `202 Accepted`.
//!
//! Session setup extracts and validates `tags` / `tag-filter` / `preset` /
//! `pagination` query parameters and, when OAuth is enabled, the bearer
//! token; the resulting filter and auth context ride on the session for
//! every later dispatch.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::routing::get;
use axum::routing::post;
use futures::Stream;
use futures::StreamExt;
use mcp_types::JSONRPCMessage;
use onemcp_core::error::ProxyError;
use onemcp_core::filter::FilterContext;
use onemcp_core::filter::parse_simple_tags;
use onemcp_core::filter::parse_tag_filter;
use onemcp_core::filter::resolve_with_grant;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use tracing::info;

use crate::message_processor::MessageProcessor;
use crate::oauth::endpoints as oauth_endpoints;
use crate::oauth::endpoints::validate_bearer;
use crate::oauth::rate_limit::RateLimiter;
use crate::proxy::ProxyState;
use crate::session::AuthContext;
use crate::session::InboundSession;

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ProxyState>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn build_router(proxy: Arc<ProxyState>) -> Router {
    let oauth_enabled = proxy.oauth_store.is_some();
    let state = AppState {
        proxy,
        rate_limiter: Arc::new(RateLimiter::default()),
    };

    let mut router = Router::new()
        .route(
            "/mcp",
            post(post_mcp).get(get_mcp).delete(delete_mcp),
        )
        .route("/sse", get(get_sse))
        .route("/messages", post(post_messages))
        .route("/health", get(health));

    if oauth_enabled {
        router = router
            .route(
                "/.well-known/oauth-authorization-server",
                get(oauth_endpoints::authorization_server_metadata),
            )
            .route(
                "/.well-known/oauth-protected-resource",
                get(oauth_endpoints::protected_resource_metadata),
            )
            .route("/register", post(oauth_endpoints::register))
            .route("/authorize", get(oauth_endpoints::authorize))
            .route("/token", post(oauth_endpoints::token))
            .route("/revoke", post(oauth_endpoints::revoke));
    }

    router.with_state(state)
}

pub async fn serve(proxy: Arc<ProxyState>, addr: SocketAddr) -> anyhow::Result<()> {
    let router = build_router(proxy);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Liveness plus per-server connection status. Unauthenticated.
async fn health(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    let connections = state.proxy.manager.connections();
    let servers: Vec<serde_json::Value> = connections
        .values()
        .map(|conn| {
            let conn_state = conn.state();
            json!({
                "name": conn.name,
                "status": conn.status().as_str(),
                "tags": conn.tags(),
                "lastError": conn_state.last_error,
                "lastConnectedAt": conn_state.last_connected_at,
            })
        })
        .collect();
    axum::Json(json!({
        "status": "ok",
        "activeSessions": state.proxy.sessions.len(),
        "servers": servers,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct McpQuery {
    pub tags: Option<String>,
    #[serde(rename = "tag-filter")]
    pub tag_filter: Option<String>,
    pub preset: Option<String>,
    pub pagination: Option<bool>,
}

fn bad_request(description: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "invalid_request",
            "error_description": description.into(),
        })),
    )
        .into_response()
}

fn insufficient_scope(err: &ProxyError) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "insufficient_scope",
            "error_description": err.to_string(),
        })),
    )
        .into_response()
}

/// Build and register a session from query parameters and (when auth is on)
/// the bearer token.
fn session_setup(
    state: &AppState,
    session_id: String,
    query: &McpQuery,
    headers: &HeaderMap,
) -> Result<Arc<InboundSession>, Response> {
    debug!(
        "session setup {session_id}: headers = {:?}",
        redacted_headers(headers)
    );

    let auth: Option<AuthContext> = match &state.proxy.oauth_store {
        Some(store) => Some(validate_bearer(store, headers)?),
        None => None,
    };

    let mut requested = Vec::new();
    if let Some(tags) = &query.tags {
        requested.push(FilterContext::Simple(
            parse_simple_tags(tags).map_err(|err| bad_request(err.to_string()))?,
        ));
    }
    if let Some(expr) = &query.tag_filter {
        requested.push(FilterContext::Expression(
            parse_tag_filter(expr).map_err(|err| bad_request(err.to_string()))?,
        ));
    }
    if let Some(name) = &query.preset {
        let document = state
            .proxy
            .presets
            .get(name)
            .ok_or_else(|| bad_request(format!("unknown preset `{name}`")))?;
        requested.push(FilterContext::Preset {
            name: name.clone(),
            document,
        });
    }
    let requested = match requested.len() {
        0 => FilterContext::None,
        1 => requested.remove(0),
        _ => {
            return Err(bad_request(
                "tags, tag-filter and preset are mutually exclusive",
            ));
        }
    };

    let granted = auth.as_ref().map(|auth| &auth.granted_tags);
    let filter = resolve_with_grant(requested, granted).map_err(|err| match err {
        ProxyError::InsufficientScope { .. } => insufficient_scope(&err),
        other => bad_request(other.to_string()),
    })?;

    let session = InboundSession::new(
        session_id,
        filter,
        auth,
        query.pagination.unwrap_or(false),
    );
    state.proxy.sessions.insert(Arc::clone(&session));
    Ok(session)
}

/// Removes (and cancels) a session when the transport's event stream is
/// dropped.
struct SessionDropGuard {
    state: AppState,
    session_id: String,
}

impl Drop for SessionDropGuard {
    fn drop(&mut self) {
        debug!("transport closed; removing session {}", self.session_id);
        self.state.proxy.sessions.remove(&self.session_id);
    }
}

// ---------------------------------------------------------------------------
// Streamable HTTP
// ---------------------------------------------------------------------------

async fn post_mcp(
    State(state): State<AppState>,
    Query(query): Query<McpQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let (session, fresh) = match headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(id) => match state.proxy.sessions.get(id) {
            Some(session) => (session, false),
            None => return (StatusCode::NOT_FOUND, "unknown session").into_response(),
        },
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            match session_setup(&state, id, &query, &headers) {
                Ok(session) => (session, true),
                Err(response) => return response,
            }
        }
    };

    let message = match serde_json::from_str::<JSONRPCMessage>(&body) {
        Ok(message) => message,
        Err(err) => return bad_request(format!("body is not a JSON-RPC message: {err}")),
    };

    let mut processor =
        MessageProcessor::new(Arc::clone(&session), Arc::clone(&state.proxy.dispatcher));
    let reply = tokio::select! {
        reply = processor.process(message) => reply,
        _ = session.cancel.cancelled() => {
            return (StatusCode::NOT_FOUND, "session closed").into_response();
        }
    };

    let mut response = match reply {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if fresh || !headers.contains_key(MCP_SESSION_ID_HEADER) {
        if let Ok(value) = session.id.parse() {
            response
                .headers_mut()
                .insert(MCP_SESSION_ID_HEADER, value);
        }
    }
    response
}

async fn get_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return bad_request("mcp-session-id header is required");
    };
    let Some(session) = state.proxy.sessions.get(id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let Some(outgoing_rx) = session.take_outgoing() else {
        return (StatusCode::CONFLICT, "event stream already open").into_response();
    };

    let guard = SessionDropGuard {
        state: state.clone(),
        session_id: session.id.clone(),
    };
    let stream = message_stream(outgoing_rx, guard);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn delete_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return bad_request("mcp-session-id header is required");
    };
    match state.proxy.sessions.remove(id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => (StatusCode::NOT_FOUND, "unknown session").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Legacy SSE
// ---------------------------------------------------------------------------

async fn get_sse(
    State(state): State<AppState>,
    Query(query): Query<McpQuery>,
    headers: HeaderMap,
) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let session = match session_setup(&state, id, &query, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(outgoing_rx) = session.take_outgoing() else {
        return (StatusCode::CONFLICT, "event stream already open").into_response();
    };

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={}", session.id));
    let guard = SessionDropGuard {
        state: state.clone(),
        session_id: session.id.clone(),
    };
    let stream =
        futures::stream::once(async move { Ok::<_, Infallible>(endpoint) })
            .chain(message_stream(outgoing_rx, guard));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn post_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    body: String,
) -> Response {
    let Some(session) = state.proxy.sessions.get(&query.session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let message = match serde_json::from_str::<JSONRPCMessage>(&body) {
        Ok(message) => message,
        Err(err) => return bad_request(format!("body is not a JSON-RPC message: {err}")),
    };

    let mut processor =
        MessageProcessor::new(Arc::clone(&session), Arc::clone(&state.proxy.dispatcher));
    let reply = tokio::select! {
        reply = processor.process(message) => reply,
        _ = session.cancel.cancelled() => {
            return (StatusCode::NOT_FOUND, "session closed").into_response();
        }
    };
    // On this transport replies travel over the event stream.
    if let Some(reply) = reply {
        session.outgoing.send_message(reply).await;
    }
    StatusCode::ACCEPTED.into_response()
}

fn message_stream(
    outgoing_rx: tokio::sync::mpsc::UnboundedReceiver<JSONRPCMessage>,
    guard: SessionDropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    UnboundedReceiverStream::new(outgoing_rx).map(move |message| {
        // Holding the guard inside the closure ties the session's lifetime
        // to the stream.
        let _ = &guard;
        let data = serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("message").data(data))
    })
}

/// Header map rendered for logs with secret-bearing values masked.
fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE: &[&str] = &[
        "authorization",
        "proxy-authorization",
        "token",
        "secret",
        "password",
        "apikey",
        "api-key",
        "cookie",
    ];
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let shown = if SENSITIVE.iter().any(|s| lower.contains(s)) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn redaction_masks_secret_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tk-secret".parse().expect("value"));
        headers.insert("x-api-key", "k".parse().expect("value"));
        headers.insert("accept", "application/json".parse().expect("value"));

        let redacted = redacted_headers(&headers);
        let lookup = |name: &str| {
            redacted
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(lookup("authorization").as_deref(), Some("[REDACTED]"));
        assert_eq!(lookup("x-api-key").as_deref(), Some("[REDACTED]"));
        assert_eq!(lookup("accept").as_deref(), Some("application/json"));
    }
}
