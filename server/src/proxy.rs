//! Shared proxy state and the background loops that tie catalog changes,
//! outbound events and preset edits to the inbound sessions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use mcp_types::ModelContextProtocolNotification;
use onemcp_core::catalog::CatalogService;
use onemcp_core::config;
use onemcp_core::dispatcher::Dispatcher;
use onemcp_core::error::codes;
use onemcp_core::filter::FilterContext;
use onemcp_core::outbound::OutboundEvent;
use onemcp_core::outbound::OutboundManager;
use onemcp_core::preset::PresetStore;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use crate::oauth::store::FileSessionStore;
use crate::session::SessionRegistry;

pub struct ProxyState {
    pub catalog: Arc<CatalogService>,
    pub manager: Arc<OutboundManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub presets: Arc<PresetStore>,
    pub sessions: Arc<SessionRegistry>,
    /// Present when OAuth gating is enabled.
    pub oauth_store: Option<Arc<FileSessionStore>>,
    /// Externally visible base URL, used as the OAuth issuer.
    pub public_url: String,
}

impl ProxyState {
    /// Construct every long-lived component and connect the initial catalog.
    /// Returns the state plus the outbound event stream for
    /// [`spawn_event_loops`].
    pub async fn bootstrap(
        config_dir: PathBuf,
        catalog_path: PathBuf,
        enable_auth: bool,
        public_url: String,
    ) -> Result<(Arc<Self>, mpsc::Receiver<OutboundEvent>)> {
        let catalog = Arc::new(CatalogService::load(catalog_path)?);
        let (manager, events_rx) = OutboundManager::new(config::PROXY_SERVER_NAME.to_string());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&manager)));
        let presets = Arc::new(PresetStore::load(
            config_dir.join(config::PRESETS_FILE_NAME),
        ));

        let oauth_store = if enable_auth {
            let store = Arc::new(FileSessionStore::new(
                config_dir.join(config::SESSIONS_DIR_NAME),
            )?);
            store.spawn_sweeper();
            Some(store)
        } else {
            None
        };

        let snapshot = catalog.current();
        manager.reconcile(&snapshot).await;
        catalog.watch()?;

        let state = Arc::new(Self {
            catalog,
            manager,
            dispatcher,
            presets,
            sessions: Arc::new(SessionRegistry::default()),
            oauth_store,
            public_url,
        });
        Ok((state, events_rx))
    }
}

/// Wire the background loops:
/// - catalog changes drive reconciliation (serialized in the manager),
/// - outbound events fan out to admitted inbound sessions,
/// - preset edits re-bind and nudge their sessions.
pub fn spawn_event_loops(state: Arc<ProxyState>, mut events_rx: mpsc::Receiver<OutboundEvent>) {
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut catalog_rx = state.catalog.subscribe();
            while let Ok(snapshot) = catalog_rx.recv().await {
                state.manager.reconcile(&snapshot).await;
            }
        });
    }

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                handle_outbound_event(&state, event).await;
            }
        });
    }

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut preset_rx = state.presets.subscribe();
            while let Ok(name) = preset_rx.recv().await {
                handle_preset_change(&state, &name).await;
            }
        });
    }
}

async fn handle_outbound_event(state: &Arc<ProxyState>, event: OutboundEvent) {
    match event {
        OutboundEvent::Notification {
            server,
            notification,
        } => {
            let params = rewrite_notification_params(&server, &notification);
            // Admission is recomputed per notification against the live
            // filter; sessions are visited sequentially so each one observes
            // the server's emission order.
            for session in state.sessions.all() {
                if state
                    .dispatcher
                    .filter_admits(&session.filter(), &server)
                {
                    session
                        .outgoing
                        .send_notification(&notification.method, params.clone())
                        .await;
                }
            }
        }
        OutboundEvent::Request { server, request } => {
            forward_sampling(state, server, request).await;
        }
        OutboundEvent::Disconnected { server } => {
            info!("outbound server `{server}` dropped its transport");
            // One automatic reconnect attempt after a short grace period.
            // If the server is really gone the record settles in `Error`
            // and stays there until the next catalog change.
            let state = Arc::clone(state);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if let Err(err) = state.manager.reconnect(&server).await {
                    warn!("automatic reconnect of `{server}` failed: {err}");
                }
            });
        }
        OutboundEvent::CapabilitiesChanged { categories } => {
            for category in categories {
                let Some(method) = category.list_changed_method() else {
                    continue;
                };
                for session in state.sessions.all() {
                    session.outgoing.send_notification(method, None).await;
                }
            }
        }
    }
}

/// Identifiers inside forwarded notifications must be composite so the
/// inbound client can address follow-up requests. Today that is only the
/// `uri` of `notifications/resources/updated`.
fn rewrite_notification_params(
    server: &str,
    notification: &mcp_types::JSONRPCNotification,
) -> Option<serde_json::Value> {
    let mut params = notification.params.clone();
    if notification.method == mcp_types::ResourceUpdatedNotification::METHOD
        && let Some(serde_json::Value::Object(map)) = params.as_mut()
        && let Some(serde_json::Value::String(uri)) = map.get_mut("uri")
    {
        *uri = onemcp_core::naming::compose_id(server, uri);
    }
    params
}

/// Forward a server-initiated request (sampling) to the inbound session that
/// originated the current outbound call, then relay the answer back.
async fn forward_sampling(
    state: &Arc<ProxyState>,
    server: String,
    request: mcp_types::JSONRPCRequest,
) {
    let Some(client) = state
        .manager
        .connection(&server)
        .and_then(|conn| conn.client())
    else {
        return;
    };

    let target = state
        .dispatcher
        .sampling_target(&server)
        .and_then(|session_id| state.sessions.get(&session_id));
    let Some(session) = target else {
        warn!("no inbound session to answer `{}` from `{server}`", request.method);
        let _ = client
            .respond_error(
                request.id,
                mcp_types::JSONRPCErrorError {
                    code: codes::INTERNAL_SERVER_ERROR,
                    message: "no inbound session available for sampling".to_string(),
                    data: None,
                },
            )
            .await;
        return;
    };

    let callback = session
        .outgoing
        .send_request(&request.method, request.params)
        .await;
    tokio::spawn(async move {
        match callback.await {
            Ok(result) => {
                let _ = client.respond(request.id, result).await;
            }
            Err(_) => {
                let _ = client
                    .respond_error(
                        request.id,
                        mcp_types::JSONRPCErrorError {
                            code: codes::INTERNAL_SERVER_ERROR,
                            message: "inbound session closed before responding".to_string(),
                            data: None,
                        },
                    )
                    .await;
            }
        }
    });
}

/// A preset changed: re-bind every session pointing at it and tell those
/// clients to re-list.
async fn handle_preset_change(state: &Arc<ProxyState>, name: &str) {
    let document = state.presets.get(name);
    for session in state.sessions.all() {
        if session.bound_preset().as_deref() != Some(name) {
            continue;
        }
        match &document {
            Some(document) => session.set_filter(FilterContext::Preset {
                name: name.to_string(),
                document: document.clone(),
            }),
            // The preset was deleted out from under the session; fall back
            // to no filtering rather than killing the session.
            None => session.set_filter(FilterContext::None),
        }
        for method in [
            mcp_types::ToolListChangedNotification::METHOD,
            mcp_types::ResourceListChangedNotification::METHOD,
            mcp_types::PromptListChangedNotification::METHOD,
        ] {
            session.outgoing.send_notification(method, None).await;
        }
    }
}
