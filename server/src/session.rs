//! Inbound session records and the registry that owns them.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use mcp_types::JSONRPCMessage;
use onemcp_core::filter::FilterContext;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::outgoing_message::OutgoingMessageSender;

/// Authenticated context attached by the HTTP bearer middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub granted_tags: BTreeSet<String>,
}

pub struct InboundSession {
    pub id: String,
    pub outgoing: Arc<OutgoingMessageSender>,
    /// Messages the transport must deliver to the client. Taken exactly once
    /// by the transport's event-stream task.
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<JSONRPCMessage>>>,
    filter: RwLock<FilterContext>,
    pub auth: Option<AuthContext>,
    pub pagination: bool,
    pub created_at: DateTime<Utc>,
    /// Cancelled when the session's transport closes; in-flight dispatches
    /// bound to this session observe it and stop.
    pub cancel: CancellationToken,
    initialized: AtomicBool,
}

impl InboundSession {
    pub fn new(
        id: String,
        filter: FilterContext,
        auth: Option<AuthContext>,
        pagination: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            outgoing: Arc::new(OutgoingMessageSender::new(tx)),
            outgoing_rx: Mutex::new(Some(rx)),
            filter: RwLock::new(filter),
            auth,
            pagination,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// Record the `initialize` handshake. Returns false when it had already
    /// happened on this session.
    pub fn mark_initialized(&self) -> bool {
        !self.initialized.swap(true, Ordering::SeqCst)
    }

    pub fn filter(&self) -> FilterContext {
        match self.filter.read() {
            Ok(guard) => guard.clone(),
            Err(err) => err.into_inner().clone(),
        }
    }

    /// Re-bind the session filter (used when a bound preset changes).
    pub fn set_filter(&self, filter: FilterContext) {
        let mut guard = match self.filter.write() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        *guard = filter;
    }

    /// The name of the preset this session is bound to, if any.
    pub fn bound_preset(&self) -> Option<String> {
        match self.filter() {
            FilterContext::Preset { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Hand the outgoing stream to the transport. Yields `None` after the
    /// first take.
    pub fn take_outgoing(&self) -> Option<mpsc::UnboundedReceiver<JSONRPCMessage>> {
        let mut guard = match self.outgoing_rx.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.take()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<InboundSession>>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<InboundSession>) {
        let mut guard = match self.sessions.write() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<InboundSession>> {
        let guard = match self.sessions.read() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.get(id).cloned()
    }

    /// Remove a session and cancel its in-flight work.
    pub fn remove(&self, id: &str) -> Option<Arc<InboundSession>> {
        let removed = {
            let mut guard = match self.sessions.write() {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
            guard.remove(id)
        };
        if let Some(session) = &removed {
            session.cancel.cancel();
        }
        removed
    }

    pub fn all(&self) -> Vec<Arc<InboundSession>> {
        let guard = match self.sessions.read() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let guard = match self.sessions.read() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn registry_insert_get_remove() {
        let registry = SessionRegistry::default();
        let session = InboundSession::new("s1".to_string(), FilterContext::None, None, false);
        registry.insert(Arc::clone(&session));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("s1").is_some());

        let removed = registry.remove("s1").expect("removed");
        assert!(removed.cancel.is_cancelled());
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn outgoing_stream_is_taken_once() {
        let session = InboundSession::new("s1".to_string(), FilterContext::None, None, false);
        assert!(session.take_outgoing().is_some());
        assert!(session.take_outgoing().is_none());
    }
}
