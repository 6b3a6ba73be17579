//! Connection manager for outbound MCP servers.
//!
//! The [`OutboundManager`] owns one [`McpClient`] per enabled catalog entry,
//! keyed by server name. Reconciliation aligns the connection set with a
//! catalog snapshot: new entries connect with retry, removed entries are torn
//! down, changed entries are rebuilt. The published map is immutable per
//! generation; readers observe a consistent snapshot for the duration of one
//! request.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::DateTime;
use chrono::Utc;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::MCP_SCHEMA_VERSION;
use mcp_types::ServerCapabilities;
use onemcp_mcp_client::ClientEvent;
use onemcp_mcp_client::McpClient;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use crate::capabilities;
use crate::capabilities::CapabilityCategory;
use crate::config::CatalogSnapshot;
use crate::config::McpServerConfig;
use crate::config::McpServerTransportConfig;
use crate::error::ProxyError;

/// Total connect attempts per server before the record lands in `Error`.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

const INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Fallback per-request timeout when the catalog entry does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    AwaitingOAuth,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Error => "error",
            ClientStatus::AwaitingOAuth => "awaiting_oauth",
        }
    }

    /// The legal transitions of the status machine. Everything else is a
    /// programming error and is rejected (and logged) by `set_status`.
    fn can_transition_to(self, next: ClientStatus) -> bool {
        use ClientStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, AwaitingOAuth)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
                | (Error, Connecting)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub status: ClientStatus,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub capabilities: Option<ServerCapabilities>,
    pub server_info: Option<Implementation>,
}

/// One record per enabled catalog entry. Mutated only by the manager's
/// reconcile loop and transport callbacks; everyone else reads.
pub struct OutboundConnection {
    pub name: String,
    pub config: McpServerConfig,
    tags: BTreeSet<String>,
    client: RwLock<Option<Arc<McpClient>>>,
    state: RwLock<ConnectionState>,
}

impl OutboundConnection {
    fn new(name: String, config: McpServerConfig) -> Self {
        let tags = config.tags.iter().cloned().collect();
        Self {
            name,
            config,
            tags,
            client: RwLock::new(None),
            state: RwLock::new(ConnectionState {
                status: ClientStatus::Connecting,
                last_error: None,
                last_connected_at: None,
                capabilities: None,
                server_info: None,
            }),
        }
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn status(&self) -> ClientStatus {
        self.read_state().status
    }

    pub fn state(&self) -> ConnectionState {
        self.read_state().clone()
    }

    pub fn client(&self) -> Option<Arc<McpClient>> {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(err) => err.into_inner().clone(),
        }
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.read_state().capabilities.clone()
    }

    pub fn request_timeout(&self) -> Duration {
        self.config
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ConnectionState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    fn set_status(&self, next: ClientStatus) -> bool {
        let mut state = self.write_state();
        if !state.status.can_transition_to(next) {
            warn!(
                "illegal status transition {:?} -> {next:?} for `{}` ignored",
                state.status, self.name
            );
            return false;
        }
        if next == ClientStatus::Connecting {
            // Only the explicit reconnect edge clears the previous error.
            state.last_error = None;
        }
        state.status = next;
        true
    }

    /// Connected implies observed capabilities: both are written under one
    /// lock so readers can never see a `Connected` record without them.
    fn mark_connected(&self, client: Arc<McpClient>, init: InitializeResult) {
        {
            let mut guard = match self.client.write() {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
            *guard = Some(client);
        }
        let mut state = self.write_state();
        state.capabilities = Some(init.capabilities);
        state.server_info = Some(init.server_info);
        state.last_connected_at = Some(Utc::now());
        state.last_error = None;
        state.status = ClientStatus::Connected;
    }

    fn mark_failed(&self, status: ClientStatus, message: String) {
        let mut state = self.write_state();
        state.last_error = Some(message);
        state.status = status;
    }

    async fn shutdown(&self) {
        let client = {
            let mut guard = match self.client.write() {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
            guard.take()
        };
        if let Some(client) = client {
            client.close().await;
        }
    }
}

/// Events surfaced to the inbound layer.
#[derive(Debug)]
pub enum OutboundEvent {
    /// A server-to-client notification from an outbound server, to be
    /// forwarded to every admitted inbound session.
    Notification {
        server: String,
        notification: JSONRPCNotification,
    },
    /// A server-initiated request (sampling) to be forwarded to the inbound
    /// session that originated the current outbound call.
    Request {
        server: String,
        request: JSONRPCRequest,
    },
    /// The transport of a connected server closed.
    Disconnected { server: String },
    /// The aggregated capability set changed in these categories.
    CapabilitiesChanged { categories: Vec<CapabilityCategory> },
}

enum ConnectFailure {
    SelfLoop(String),
    AuthRequired(String),
    Other(String),
}

/// A thin wrapper around the set of running outbound clients.
pub struct OutboundManager {
    proxy_name: String,
    connections: ArcSwap<BTreeMap<String, Arc<OutboundConnection>>>,
    aggregated: ArcSwap<ServerCapabilities>,
    events_tx: mpsc::Sender<OutboundEvent>,
    /// Reconciliations are serialized: at most one runs at a time, new
    /// catalog changes queue on this lock.
    reconcile_lock: Mutex<()>,
}

impl OutboundManager {
    pub fn new(proxy_name: String) -> (Arc<Self>, mpsc::Receiver<OutboundEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            proxy_name,
            connections: ArcSwap::from_pointee(BTreeMap::new()),
            aggregated: ArcSwap::from_pointee(ServerCapabilities::default()),
            events_tx,
            reconcile_lock: Mutex::new(()),
        });
        (manager, events_rx)
    }

    /// The current generation of connection records, in name order.
    pub fn connections(&self) -> Arc<BTreeMap<String, Arc<OutboundConnection>>> {
        self.connections.load_full()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        self.connections.load().get(name).cloned()
    }

    pub fn aggregated_capabilities(&self) -> ServerCapabilities {
        (**self.aggregated.load()).clone()
    }

    /// Align the connection set with a catalog snapshot and wait until every
    /// new record has quiesced in `Connected`, `Error` or `AwaitingOAuth`.
    /// Per-server failures never abort the rest of the set.
    pub async fn reconcile(self: &Arc<Self>, snapshot: &CatalogSnapshot) {
        let _guard = self.reconcile_lock.lock().await;

        let current = self.connections.load_full();
        let mut next: BTreeMap<String, Arc<OutboundConnection>> = BTreeMap::new();
        let mut to_connect: Vec<Arc<OutboundConnection>> = Vec::new();

        for (name, config) in snapshot.enabled() {
            match current.get(name) {
                Some(existing) if existing.config == *config => {
                    next.insert(name.clone(), Arc::clone(existing));
                }
                _ => {
                    let conn = Arc::new(OutboundConnection::new(name.clone(), config.clone()));
                    next.insert(name.clone(), Arc::clone(&conn));
                    to_connect.push(conn);
                }
            }
        }

        // Tear down records that were removed or replaced.
        for (name, conn) in current.iter() {
            let kept = next
                .get(name)
                .map(|candidate| Arc::ptr_eq(candidate, conn))
                .unwrap_or(false);
            if !kept {
                info!("closing outbound connection `{name}`");
                conn.shutdown().await;
            }
        }

        self.connections.store(Arc::new(next));

        let mut join_set = JoinSet::new();
        for conn in to_connect {
            let manager = Arc::clone(self);
            join_set.spawn(async move {
                manager.connect_with_retry(conn).await;
            });
        }
        while let Some(join_res) = join_set.join_next().await {
            if let Err(err) = join_res {
                warn!("connect task panicked: {err:#}");
            }
        }

        self.republish_capabilities().await;
    }

    /// Explicit reconnect of a `Disconnected`/`Error` record. Clears the
    /// previous error per the status machine.
    pub async fn reconnect(self: &Arc<Self>, name: &str) -> Result<(), ProxyError> {
        let conn = self
            .connection(name)
            .ok_or_else(|| ProxyError::ClientNotFound {
                name: name.to_string(),
            })?;
        if !conn.set_status(ClientStatus::Connecting) {
            return Err(ProxyError::validation(format!(
                "`{name}` is not in a reconnectable state"
            )));
        }
        self.connect_with_retry(Arc::clone(&conn)).await;
        self.republish_capabilities().await;
        match conn.status() {
            ClientStatus::Connected => Ok(()),
            other => Err(ProxyError::ClientConnection {
                name: name.to_string(),
                message: format!("reconnect ended in {other:?}"),
            }),
        }
    }

    pub async fn shutdown(&self) {
        let current = self.connections.load_full();
        for conn in current.values() {
            conn.shutdown().await;
        }
        self.connections.store(Arc::new(BTreeMap::new()));
    }

    async fn connect_with_retry(self: &Arc<Self>, conn: Arc<OutboundConnection>) {
        // The proxy's own name is reserved; an entry carrying it can only be
        // this proxy reached through its own catalog.
        if conn.name == self.proxy_name {
            conn.mark_failed(
                ClientStatus::Error,
                format!(
                    "circular dependency: `{}` is the proxy's reserved name",
                    conn.name
                ),
            );
            return;
        }

        let mut delay = INITIAL_CONNECT_DELAY;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.try_connect(&conn).await {
                Ok(()) => {
                    info!("connected to `{}`", conn.name);
                    return;
                }
                Err(ConnectFailure::SelfLoop(message)) => {
                    warn!("refusing to connect `{}`: {message}", conn.name);
                    conn.mark_failed(ClientStatus::Error, message);
                    return;
                }
                Err(ConnectFailure::AuthRequired(message)) => {
                    info!("`{}` requires OAuth completion: {message}", conn.name);
                    conn.mark_failed(ClientStatus::AwaitingOAuth, message);
                    return;
                }
                Err(ConnectFailure::Other(message)) => {
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        warn!(
                            "connect attempt {attempt}/{MAX_CONNECT_ATTEMPTS} for `{}` failed: \
                             {message}; retrying in {delay:?}",
                            conn.name
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        warn!(
                            "giving up on `{}` after {MAX_CONNECT_ATTEMPTS} attempts: {message}",
                            conn.name
                        );
                        conn.mark_failed(ClientStatus::Error, message);
                    }
                }
            }
        }
    }

    async fn try_connect(self: &Arc<Self>, conn: &Arc<OutboundConnection>) -> Result<(), ConnectFailure> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = make_client(&conn.name, &conn.config.transport, events_tx)
            .await
            .map_err(|err| classify_connect_error(&format!("{err:#}")))?;
        let client = Arc::new(client);

        let params = InitializeRequestParams {
            capabilities: ClientCapabilities {
                sampling: Some(serde_json::json!({})),
                ..Default::default()
            },
            client_info: Implementation {
                name: self.proxy_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("onemcp proxy".to_string()),
            },
            protocol_version: MCP_SCHEMA_VERSION.to_string(),
        };

        let initialize_result = match client
            .initialize(params, Some(conn.request_timeout()))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                client.close().await;
                return Err(classify_connect_error(&format!("{err:#}")));
            }
        };

        // Self-loop guard: a server that identifies itself with our own name
        // is this proxy reached through its own catalog.
        if initialize_result.server_info.name == self.proxy_name {
            client.close().await;
            return Err(ConnectFailure::SelfLoop(format!(
                "circular dependency: `{}` is this proxy",
                conn.name
            )));
        }

        conn.mark_connected(Arc::clone(&client), initialize_result);
        self.spawn_event_pump(Arc::clone(conn), events_rx);
        Ok(())
    }

    // Pump per-client transport events into the manager-wide event channel,
    // tagging them with the server name.
    fn spawn_event_pump(
        self: &Arc<Self>,
        conn: Arc<OutboundConnection>,
        mut events_rx: mpsc::Receiver<ClientEvent>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ClientEvent::Notification(notification) => {
                        let _ = manager
                            .events_tx
                            .send(OutboundEvent::Notification {
                                server: conn.name.clone(),
                                notification,
                            })
                            .await;
                    }
                    ClientEvent::Request(request) => {
                        let _ = manager
                            .events_tx
                            .send(OutboundEvent::Request {
                                server: conn.name.clone(),
                                request,
                            })
                            .await;
                    }
                    ClientEvent::Closed => {
                        if conn.set_status(ClientStatus::Disconnected) {
                            warn!("outbound server `{}` disconnected", conn.name);
                            let _ = manager
                                .events_tx
                                .send(OutboundEvent::Disconnected {
                                    server: conn.name.clone(),
                                })
                                .await;
                            manager.republish_capabilities().await;
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Recompute the aggregate over `Connected` records and broadcast which
    /// categories changed.
    pub async fn republish_capabilities(&self) {
        let connections = self.connections.load_full();
        let caps: Vec<ServerCapabilities> = connections
            .values()
            .filter(|conn| conn.status() == ClientStatus::Connected)
            .filter_map(|conn| conn.capabilities())
            .collect();
        let new = capabilities::aggregate(caps.iter());
        let old = self.aggregated.load_full();
        let categories = capabilities::changed_categories(&old, &new);
        if categories.is_empty() {
            return;
        }
        self.aggregated.store(Arc::new(new));
        let _ = self
            .events_tx
            .send(OutboundEvent::CapabilitiesChanged { categories })
            .await;
    }
}

/// Transport factory: build (and open) the outbound client described by a
/// catalog entry.
pub async fn make_client(
    server_name: &str,
    transport: &McpServerTransportConfig,
    events_tx: mpsc::Sender<ClientEvent>,
) -> Result<McpClient, ProxyError> {
    match transport {
        McpServerTransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            let command_os: OsString = command.clone().into();
            let args_os: Vec<OsString> = args.iter().cloned().map(Into::into).collect();
            McpClient::new_stdio_client(command_os, args_os, env.clone(), cwd.clone(), events_tx)
                .await
                .map_err(|err| ProxyError::Transport {
                    name: server_name.to_string(),
                    message: format!("failed to spawn `{command}`: {err}"),
                })
        }
        McpServerTransportConfig::Http { url, headers } => {
            McpClient::new_http_client(url, headers.clone(), events_tx)
                .await
                .map_err(|err| ProxyError::Transport {
                    name: server_name.to_string(),
                    message: format!("{err:#}"),
                })
        }
        McpServerTransportConfig::Sse { url, headers } => {
            McpClient::new_sse_client(url, headers.clone(), events_tx)
                .await
                .map_err(|err| ProxyError::Transport {
                    name: server_name.to_string(),
                    message: format!("{err:#}"),
                })
        }
    }
}

fn classify_connect_error(message: &str) -> ConnectFailure {
    if message.contains("401") || message.contains("Auth required") {
        ConnectFailure::AuthRequired(message.to_string())
    } else {
        ConnectFailure::Other(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn http_config(url: &str) -> McpServerConfig {
        serde_json::from_value(json!({ "type": "http", "url": url })).expect("config")
    }

    fn connection(name: &str) -> OutboundConnection {
        OutboundConnection::new(name.to_string(), http_config("https://example"))
    }

    #[test]
    fn new_records_start_connecting() {
        let conn = connection("a");
        assert_eq!(conn.status(), ClientStatus::Connecting);
        assert!(conn.state().capabilities.is_none());
    }

    #[test]
    fn status_machine_accepts_only_legal_transitions() {
        let conn = connection("a");
        assert!(!conn.set_status(ClientStatus::Disconnected));
        assert!(conn.set_status(ClientStatus::Error));
        assert!(!conn.set_status(ClientStatus::Connected));
        assert!(conn.set_status(ClientStatus::Connecting));
        assert!(conn.set_status(ClientStatus::AwaitingOAuth));
    }

    #[test]
    fn reconnect_edge_clears_last_error() {
        let conn = connection("a");
        conn.mark_failed(ClientStatus::Error, "boom".to_string());
        assert_eq!(conn.state().last_error.as_deref(), Some("boom"));
        assert!(conn.set_status(ClientStatus::Connecting));
        assert_eq!(conn.state().last_error, None);
    }

    #[test]
    fn request_timeout_prefers_catalog_value() {
        let mut config = http_config("https://example");
        config.timeout = Some(5000);
        let conn = OutboundConnection::new("a".to_string(), config);
        assert_eq!(conn.request_timeout(), Duration::from_millis(5000));
        assert_eq!(connection("b").request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn auth_errors_are_classified() {
        assert!(matches!(
            classify_connect_error("HTTP status client error (401 Unauthorized)"),
            ConnectFailure::AuthRequired(_)
        ));
        assert!(matches!(
            classify_connect_error("connection refused"),
            ConnectFailure::Other(_)
        ));
    }

    #[tokio::test]
    async fn reconcile_connects_and_removes_records() {
        let (manager, _events) = OutboundManager::new("1mcp".to_string());

        // Spawning a nonexistent binary fails fast, so records land in
        // `Error` after the retry budget. Paused time makes the backoff
        // instantaneous.
        tokio::time::pause();
        let snapshot: CatalogSnapshot = CatalogSnapshot {
            servers: BTreeMap::from([(
                "ghost".to_string(),
                serde_json::from_value(json!({
                    "type": "stdio",
                    "command": "/nonexistent/onemcp-test-binary"
                }))
                .expect("config"),
            )]),
        };
        manager.reconcile(&snapshot).await;

        let connections = manager.connections();
        assert_eq!(connections.len(), 1);
        let conn = &connections["ghost"];
        assert_eq!(conn.status(), ClientStatus::Error);
        assert!(conn.state().last_error.is_some());

        // Removing the entry drops the record on the next reconcile.
        manager.reconcile(&CatalogSnapshot::default()).await;
        assert_eq!(manager.connections().len(), 0);
    }

    #[tokio::test]
    async fn reserved_proxy_name_is_rejected_as_a_self_loop() {
        let (manager, _events) = OutboundManager::new("1mcp".to_string());
        let snapshot = CatalogSnapshot {
            servers: BTreeMap::from([("1mcp".to_string(), http_config("https://example"))]),
        };
        manager.reconcile(&snapshot).await;

        let conn = manager.connection("1mcp").expect("record");
        assert_eq!(conn.status(), ClientStatus::Error);
        let error = conn.state().last_error.expect("error message");
        assert!(error.contains("circular dependency"), "error = {error}");
    }

    #[tokio::test]
    async fn reconcile_keeps_unchanged_records() {
        let (manager, _events) = OutboundManager::new("1mcp".to_string());
        tokio::time::pause();
        let snapshot = CatalogSnapshot {
            servers: BTreeMap::from([(
                "ghost".to_string(),
                serde_json::from_value(json!({
                    "type": "stdio",
                    "command": "/nonexistent/onemcp-test-binary"
                }))
                .expect("config"),
            )]),
        };
        manager.reconcile(&snapshot).await;
        let first = manager.connection("ghost").expect("record");
        manager.reconcile(&snapshot).await;
        let second = manager.connection("ghost").expect("record");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
