//! A minimal async client for the Model Context Protocol (MCP).
//!
//! One [`McpClient`] is created per outbound server. It can:
//!   1. Spawn a subprocess that launches a conforming MCP server that
//!      communicates over stdio.
//!   2. Talk to a remote server over the streamable-HTTP or SSE transports.
//!   3. Send MCP requests and pair them with their corresponding responses.
//!   4. Surface server-initiated notifications and requests on an event
//!      channel so the owner can forward them.
//!
//! The crate hides all JSON-RPC framing details behind a typed API. Users
//! interact with the [`ModelContextProtocolRequest`] trait from `mcp-types` to
//! issue requests and receive strongly-typed results.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use mcp_types::InitializeRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializedNotification;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use reqwest::Url;
use reqwest::header::ACCEPT;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Capacity of the bounded channels used for transporting messages between the
/// client API and the IO tasks.
const CHANNEL_CAPACITY: usize = 128;

/// Session header used by the streamable-HTTP transport. The server assigns
/// an id on the first POST; every later request must carry it.
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

type SessionHeaderSlot = std::sync::Mutex<Option<String>>;

/// Internal representation of a pending request sender.
type PendingSender = oneshot::Sender<JSONRPCMessage>;

type PendingMap = Arc<Mutex<HashMap<i64, PendingSender>>>;

/// Server-initiated traffic surfaced to the owner of the client.
///
/// `Closed` fires once, when the transport reaches end-of-stream. Network
/// transports reconnect internally and never emit it; a stdio child exiting
/// does.
#[derive(Debug)]
pub enum ClientEvent {
    Notification(JSONRPCNotification),
    Request(JSONRPCRequest),
    Closed,
}

enum TransportHandle {
    Stdio(tokio::process::Child),
    Network,
}

/// A running MCP client instance.
pub struct McpClient {
    transport: Mutex<TransportHandle>,

    /// Channel for sending JSON-RPC messages *to* the background writer task.
    outgoing_tx: mpsc::Sender<JSONRPCMessage>,

    /// Map of `request.id -> oneshot::Sender` used to dispatch responses back
    /// to the originating caller.
    pending: PendingMap,

    /// Monotonically increasing counter used to generate request IDs.
    id_counter: AtomicI64,

    /// Flipped by [`close`](Self::close); network IO loops observe it and stop.
    shutdown_tx: watch::Sender<bool>,
}

impl McpClient {
    /// Spawn the given command and establish an MCP session over its STDIO.
    /// Caller is responsible for sending the `initialize` request. See
    /// [`initialize`](Self::initialize) for details.
    pub async fn new_stdio_client(
        program: OsString,
        args: Vec<OsString>,
        env: Option<HashMap<String, String>>,
        cwd: Option<PathBuf>,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> std::io::Result<Self> {
        let program_name = program.to_string_lossy().into_owned();
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(create_env_for_mcp_server(env))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // As noted in the `kill_on_drop` documentation, the Tokio runtime
            // makes a "best effort" to reap-after-exit to avoid zombie
            // processes, but it is not a guarantee.
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("MCP server stderr ({program_name}): {line}");
                }
            });
        }

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, _) = watch::channel(false);

        // Writer task: listens on the `outgoing_rx` channel and writes
        // line-delimited JSON to the child's STDIN.
        tokio::spawn({
            let mut stdin = stdin;
            async move {
                while let Some(msg) = outgoing_rx.recv().await {
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            debug!("MCP message to server: {json}");
                            if stdin.write_all(json.as_bytes()).await.is_err() {
                                error!("failed to write message to child stdin");
                                break;
                            }
                            if stdin.write_all(b"\n").await.is_err() {
                                error!("failed to write newline to child stdin");
                                break;
                            }
                            // No explicit flush needed on a pipe; write_all is sufficient.
                        }
                        Err(e) => error!("failed to serialize JSONRPCMessage: {e}"),
                    }
                }
            }
        });

        // Reader task: reads line-delimited JSON from the child's STDOUT,
        // dispatches responses to the pending map and everything else to the
        // event channel. EOF means the child is gone.
        tokio::spawn({
            let pending = pending.clone();
            let events_tx = events_tx.clone();
            let mut lines = BufReader::new(stdout).lines();

            async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("MCP message from server: {line}");
                    match serde_json::from_str::<JSONRPCMessage>(&line) {
                        Ok(message) => handle_incoming_message(message, &pending, &events_tx).await,
                        Err(e) => {
                            error!("failed to deserialize JSONRPCMessage: {e}; line = {line}")
                        }
                    }
                }
                let _ = events_tx.send(ClientEvent::Closed).await;
            }
        });

        Ok(Self {
            transport: Mutex::new(TransportHandle::Stdio(child)),
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
            shutdown_tx,
        })
    }

    /// Establish an MCP session over an SSE transport: a long-lived GET
    /// stream for server-to-client messages and POSTs for the reverse path.
    pub async fn new_sse_client(
        stream_url: &str,
        headers: Option<HashMap<String, String>>,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> Result<Self> {
        let stream_url = Url::parse(stream_url)
            .with_context(|| format!("invalid SSE stream URL: {stream_url}"))?;
        let post_url = stream_url.clone();

        let header_map = Arc::new(build_header_map(headers.as_ref())?);
        let client = reqwest::Client::builder()
            .build()
            .context("failed to construct HTTP client")?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer_client = client.clone();
        let writer_headers = Arc::clone(&header_map);
        let pending_for_writer = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                match post_json_message(&writer_client, &post_url, &writer_headers, &message, None)
                    .await
                {
                    Ok(_) => {}
                    Err(err) => handle_send_failure(&message, &pending_for_writer, err).await,
                }
            }
        });

        spawn_sse_reader(
            client,
            stream_url,
            header_map,
            Arc::clone(&pending),
            events_tx,
            shutdown_rx,
        );

        Ok(Self {
            transport: Mutex::new(TransportHandle::Network),
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
            shutdown_tx,
        })
    }

    /// Establish an MCP session over the MCP HTTP (streamable) transport.
    pub async fn new_http_client(
        stream_url: &str,
        headers: Option<HashMap<String, String>>,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> Result<Self> {
        let stream_url = Url::parse(stream_url)
            .with_context(|| format!("invalid HTTP stream URL: {stream_url}"))?;
        let post_url = stream_url.clone();

        let header_map = Arc::new(build_header_map(headers.as_ref())?);
        let client = reqwest::Client::builder()
            .build()
            .context("failed to construct HTTP client")?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session_id: Arc<SessionHeaderSlot> = Arc::new(SessionHeaderSlot::default());

        let writer_client = client.clone();
        let writer_headers = Arc::clone(&header_map);
        let pending_for_writer = Arc::clone(&pending);
        let events_for_writer = events_tx.clone();
        let writer_session = Arc::clone(&session_id);
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                match post_json_message(
                    &writer_client,
                    &post_url,
                    &writer_headers,
                    &message,
                    Some(&writer_session),
                )
                .await
                {
                    Ok(response) => {
                        if let Err(err) = process_ndjson_stream(
                            response,
                            Arc::clone(&pending_for_writer),
                            &events_for_writer,
                        )
                        .await
                        {
                            handle_send_failure(&message, &pending_for_writer, err).await;
                        }
                    }
                    Err(err) => handle_send_failure(&message, &pending_for_writer, err).await,
                }
            }
        });

        spawn_http_stream_reader(
            client,
            stream_url,
            header_map,
            session_id,
            Arc::clone(&pending),
            events_tx,
            shutdown_rx,
        );

        Ok(Self {
            transport: Mutex::new(TransportHandle::Network),
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
            shutdown_tx,
        })
    }

    /// Send an arbitrary MCP request and await the typed result.
    ///
    /// If `timeout` is `None` the call waits indefinitely. If `Some(duration)`
    /// is supplied and no response is received within the given period, a
    /// timeout error is returned.
    pub async fn send_request<R>(
        &self,
        params: R::Params,
        timeout: Option<Duration>,
    ) -> Result<R::Result>
    where
        R: ModelContextProtocolRequest,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        match self
            .send_raw_request(R::METHOD, serde_json::to_value(&params)?, timeout)
            .await?
        {
            JSONRPCMessage::Response(JSONRPCResponse { result, .. }) => {
                let typed: R::Result = serde_json::from_value(result)?;
                Ok(typed)
            }
            JSONRPCMessage::Error(err) => Err(anyhow!(format!(
                "server returned JSON-RPC error: code = {}, message = {}",
                err.error.code, err.error.message
            ))),
            other => Err(anyhow!(format!(
                "unexpected message variant received in reply path: {other:?}"
            ))),
        }
    }

    /// Like [`send_request`](Self::send_request) but untyped: the raw
    /// response or error envelope is handed back to the caller. The proxy
    /// uses this to forward protocol-level errors unchanged.
    pub async fn send_raw_request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<JSONRPCMessage> {
        // Create a new unique ID.
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let request_id = RequestId::Integer(id);

        // For many request types `Params` is `Option<T>` and `None` should be
        // encoded as *absence* of the field.
        let params_field = if params.is_null() { None } else { Some(params) };

        let jsonrpc_request = JSONRPCRequest {
            id: request_id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: params_field,
        };

        let message = JSONRPCMessage::Request(jsonrpc_request);

        // oneshot channel for the response.
        let (tx, rx) = oneshot::channel();

        // Register in pending map *before* sending the message so a race where
        // the response arrives immediately cannot be lost.
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        // Send to writer task.
        if self.outgoing_tx.send(message).await.is_err() {
            return Err(anyhow!(
                "failed to send message to writer task - channel closed"
            ));
        }

        // Await the response, optionally bounded by a timeout.
        match timeout {
            Some(duration) => match time::timeout(duration, rx).await {
                Ok(Ok(msg)) => Ok(msg),
                Ok(Err(_)) => {
                    // Channel closed without a reply – remove the pending entry.
                    let mut guard = self.pending.lock().await;
                    guard.remove(&id);
                    Err(anyhow!(
                        "response channel closed before a reply was received"
                    ))
                }
                Err(_) => {
                    // Timed out. Remove the pending entry so we don't leak.
                    let mut guard = self.pending.lock().await;
                    guard.remove(&id);
                    Err(anyhow!("request timed out"))
                }
            },
            None => rx
                .await
                .map_err(|_| anyhow!("response channel closed before a reply was received")),
        }
    }

    pub async fn send_notification<N>(&self, params: N::Params) -> Result<()>
    where
        N: ModelContextProtocolNotification,
        N::Params: Serialize,
    {
        let params_json = serde_json::to_value(&params)?;
        self.send_raw_notification(N::METHOD, params_json).await
    }

    /// Forward a notification whose method is only known at runtime.
    pub async fn send_raw_notification(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<()> {
        let params_field = if params.is_null() { None } else { Some(params) };
        let jsonrpc_notification = JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: params_field,
        };

        let notification = JSONRPCMessage::Notification(jsonrpc_notification);
        self.outgoing_tx
            .send(notification)
            .await
            .with_context(|| format!("failed to send notification `{method}` to writer task"))
    }

    /// Answer a server-initiated request previously surfaced as
    /// [`ClientEvent::Request`].
    pub async fn respond(&self, id: RequestId, result: serde_json::Value) -> Result<()> {
        let message = JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        });
        self.outgoing_tx
            .send(message)
            .await
            .context("failed to send response to writer task")
    }

    /// Reject a server-initiated request previously surfaced as
    /// [`ClientEvent::Request`].
    pub async fn respond_error(&self, id: RequestId, error: JSONRPCErrorError) -> Result<()> {
        let message = JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        });
        self.outgoing_tx
            .send(message)
            .await
            .context("failed to send error to writer task")
    }

    /// Negotiates the initialization with the MCP server. Sends an `initialize`
    /// request with the specified `initialize_params` and then the
    /// `notifications/initialized` notification once the response has been
    /// received. Returns the response to the `initialize` request.
    pub async fn initialize(
        &self,
        initialize_params: InitializeRequestParams,
        timeout: Option<Duration>,
    ) -> Result<mcp_types::InitializeResult> {
        let response = self
            .send_request::<InitializeRequest>(initialize_params, timeout)
            .await?;
        self.send_notification::<InitializedNotification>(None)
            .await?;
        Ok(response)
    }

    /// Tear the transport down. For a stdio transport the child process is
    /// killed; network transports stop their reconnect loops.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut transport = self.transport.lock().await;
        if let TransportHandle::Stdio(child) = &mut *transport {
            if let Err(err) = child.start_kill() {
                debug!("failed to kill MCP server child process: {err}");
            }
        }
    }

    /// Internal helper: route a JSON-RPC *response* object to the pending map.
    async fn dispatch_response(resp: JSONRPCResponse, pending: &PendingMap) {
        let id = match resp.id {
            RequestId::Integer(i) => i,
            RequestId::String(_) => {
                // We only ever generate integer IDs. Receiving a string here
                // means we will not find a matching entry in `pending`.
                error!("response with string ID - no matching pending request");
                return;
            }
        };

        let tx_opt = {
            let mut guard = pending.lock().await;
            guard.remove(&id)
        };
        if let Some(tx) = tx_opt {
            // Ignore send errors – the receiver might have been dropped.
            let _ = tx.send(JSONRPCMessage::Response(resp));
        } else {
            warn!(id, "no pending request found for response");
        }
    }

    /// Internal helper: route a JSON-RPC *error* object to the pending map.
    async fn dispatch_error(err: JSONRPCError, pending: &PendingMap) {
        let id = match err.id {
            RequestId::Integer(i) => i,
            RequestId::String(_) => return, // see comment above
        };

        let tx_opt = {
            let mut guard = pending.lock().await;
            guard.remove(&id)
        };
        if let Some(tx) = tx_opt {
            let _ = tx.send(JSONRPCMessage::Error(err));
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Ok(mut transport) = self.transport.try_lock()
            && let TransportHandle::Stdio(child) = &mut *transport
        {
            // Even though we have already tagged this process with
            // `kill_on_drop(true)` above, this extra check has the benefit of
            // forcing the process to be reaped immediately if it has already
            // exited instead of waiting for the Tokio runtime to reap it later.
            let _ = child.try_wait();
        }
    }
}

fn build_header_map(headers: Option<&HashMap<String, String>>) -> anyhow::Result<HeaderMap> {
    let mut header_map = HeaderMap::new();
    if let Some(headers) = headers {
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("invalid header name: {key}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {key}"))?;
            header_map.insert(name, value);
        }
    }
    Ok(header_map)
}

async fn post_json_message(
    client: &reqwest::Client,
    url: &Url,
    headers: &HeaderMap,
    message: &JSONRPCMessage,
    session: Option<&SessionHeaderSlot>,
) -> anyhow::Result<reqwest::Response> {
    let mut request = client.post(url.clone());
    if !headers.is_empty() {
        request = request.headers(headers.clone());
    }
    if let Some(slot) = session
        && let Some(id) = read_session_header(slot)
    {
        request = request.header(MCP_SESSION_ID_HEADER, id);
    }
    let body = serde_json::to_vec(message)?;
    let response = request
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;
    if let Some(slot) = session
        && let Some(id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
    {
        let mut guard = match slot.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        if guard.as_deref() != Some(id) {
            *guard = Some(id.to_string());
        }
    }
    Ok(response.error_for_status()?)
}

fn read_session_header(slot: &SessionHeaderSlot) -> Option<String> {
    match slot.lock() {
        Ok(guard) => guard.clone(),
        Err(err) => err.into_inner().clone(),
    }
}

fn spawn_sse_reader(
    client: reqwest::Client,
    stream_url: Url,
    headers: Arc<HeaderMap>,
    pending: PendingMap,
    events_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let mut request = client.get(stream_url.clone());
            if !headers.is_empty() {
                request = request.headers((*headers).clone());
            }
            request = request.header(ACCEPT, "text/event-stream");

            match request.send().await {
                Ok(response) => {
                    if let Err(err) =
                        process_sse_stream(response, Arc::clone(&pending), &events_tx).await
                    {
                        warn!("SSE stream error: {err:#}");
                    }
                }
                Err(err) => warn!("failed to establish SSE stream: {err:#}"),
            }

            tokio::select! {
                _ = time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}

fn spawn_http_stream_reader(
    client: reqwest::Client,
    stream_url: Url,
    headers: Arc<HeaderMap>,
    session: Arc<SessionHeaderSlot>,
    pending: PendingMap,
    events_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let mut request = client.get(stream_url.clone());
            if !headers.is_empty() {
                request = request.headers((*headers).clone());
            }
            if let Some(id) = read_session_header(&session) {
                request = request.header(MCP_SESSION_ID_HEADER, id);
            }
            request = request.header(ACCEPT, "application/x-ndjson");

            match request.send().await {
                Ok(response) => {
                    if let Err(err) =
                        process_ndjson_stream(response, Arc::clone(&pending), &events_tx).await
                    {
                        warn!("HTTP stream error: {err:#}");
                    }
                }
                Err(err) => warn!("failed to establish HTTP stream: {err:#}"),
            }

            tokio::select! {
                _ = time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}

async fn process_sse_stream(
    response: reqwest::Response,
    pending: PendingMap,
    events_tx: &mpsc::Sender<ClientEvent>,
) -> anyhow::Result<()> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("SSE stream returned {status}: {body}");
    }

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JSONRPCMessage>(data) {
                    Ok(message) => handle_incoming_message(message, &pending, events_tx).await,
                    Err(err) => {
                        warn!("failed to decode SSE payload as JSON-RPC: {err}; payload={data}")
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

async fn process_ndjson_stream(
    response: reqwest::Response,
    pending: PendingMap,
    events_tx: &mpsc::Sender<ClientEvent>,
) -> anyhow::Result<()> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("HTTP stream returned {status}: {body}");
    }

    let mut buffer = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
            if let Some(last) = line.last()
                && *last == b'\n'
            {
                line.pop();
            }
            if let Some(last) = line.last()
                && *last == b'\r'
            {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8(line)
                .map_err(|err| anyhow!("invalid UTF-8 in NDJSON stream: {err}"))?;
            match serde_json::from_str::<JSONRPCMessage>(&text) {
                Ok(message) => handle_incoming_message(message, &pending, events_tx).await,
                Err(err) => {
                    warn!("failed to decode NDJSON payload as JSON-RPC: {err}; payload={text}")
                }
            }
        }
    }

    if !buffer.is_empty() {
        let text = String::from_utf8(buffer)
            .map_err(|err| anyhow!("invalid UTF-8 in NDJSON tail: {err}"))?;
        if !text.trim().is_empty() {
            match serde_json::from_str::<JSONRPCMessage>(&text) {
                Ok(message) => handle_incoming_message(message, &pending, events_tx).await,
                Err(err) => {
                    warn!("failed to decode NDJSON tail as JSON-RPC: {err}; payload={text}")
                }
            }
        }
    }

    Ok(())
}

async fn handle_incoming_message(
    message: JSONRPCMessage,
    pending: &PendingMap,
    events_tx: &mpsc::Sender<ClientEvent>,
) {
    match message {
        JSONRPCMessage::Response(resp) => McpClient::dispatch_response(resp, pending).await,
        JSONRPCMessage::Error(err) => McpClient::dispatch_error(err, pending).await,
        JSONRPCMessage::Notification(notification) => {
            if events_tx
                .send(ClientEvent::Notification(notification))
                .await
                .is_err()
            {
                debug!("event channel closed; dropping server notification");
            }
        }
        JSONRPCMessage::Request(request) => {
            if events_tx.send(ClientEvent::Request(request)).await.is_err() {
                debug!("event channel closed; dropping server-initiated request");
            }
        }
    }
}

async fn handle_send_failure(message: &JSONRPCMessage, pending: &PendingMap, error: anyhow::Error) {
    warn!("failed to send MCP message: {error:#}");

    let request_id = match message {
        JSONRPCMessage::Request(req) => match &req.id {
            RequestId::Integer(id) => Some(*id),
            RequestId::String(_) => None,
        },
        _ => None,
    };

    if let Some(id) = request_id {
        let mut guard = pending.lock().await;
        if let Some(tx) = guard.remove(&id) {
            let err = JSONRPCError {
                jsonrpc: JSONRPC_VERSION.to_owned(),
                id: RequestId::Integer(id),
                error: JSONRPCErrorError {
                    code: -32000,
                    message: format!("failed to send request: {error:#}"),
                    data: None,
                },
            };
            let _ = tx.send(JSONRPCMessage::Error(err));
        }
    }
}

/// Environment variables that are always included when spawning a new MCP
/// server.
#[rustfmt::skip]
#[cfg(unix)]
const DEFAULT_ENV_VARS: &[&str] = &[
    // https://modelcontextprotocol.io/docs/tools/debugging#environment-variables
    // states:
    //
    // > MCP servers inherit only a subset of environment variables automatically,
    // > like `USER`, `HOME`, and `PATH`.
    //
    // But it does not fully enumerate the list. Empirically, when spawning an
    // MCP server via Claude Desktop on macOS, it reports the following
    // environment variables:
    "HOME",
    "LOGNAME",
    "PATH",
    "SHELL",
    "USER",
    "__CF_USER_TEXT_ENCODING",

    // Additional environment variables the proxy chooses to include by default:
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "TZ",
];

#[cfg(windows)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "USERNAME",
    "USERDOMAIN",
    "USERPROFILE",
    "TEMP",
    "TMP",
];

/// `extra_env` comes from the catalog entry for this server.
fn create_env_for_mcp_server(
    extra_env: Option<HashMap<String, String>>,
) -> HashMap<String, String> {
    DEFAULT_ENV_VARS
        .iter()
        .filter_map(|var| match std::env::var(var) {
            Ok(value) => Some((var.to_string(), value)),
            Err(_) => None,
        })
        .chain(extra_env.unwrap_or_default())
        .collect::<HashMap<_, _>>()
}
