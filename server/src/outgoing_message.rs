//! Sends messages to an inbound client and manages request callbacks.
//!
//! Responses to requests the *proxy* initiated (sampling forwarded from an
//! outbound server) come back through `notify_client_response`, which pairs
//! them with the oneshot handed out by `send_request`.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::RequestId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::warn;

pub struct OutgoingMessageSender {
    next_request_id: AtomicI64,
    sender: mpsc::UnboundedSender<JSONRPCMessage>,
    request_id_to_callback: Mutex<HashMap<RequestId, oneshot::Sender<Value>>>,
}

impl OutgoingMessageSender {
    pub fn new(sender: mpsc::UnboundedSender<JSONRPCMessage>) -> Self {
        Self {
            next_request_id: AtomicI64::new(0),
            sender,
            request_id_to_callback: Mutex::new(HashMap::new()),
        }
    }

    /// Send a proxy-initiated request to the client; the returned receiver
    /// fires with the client's response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> oneshot::Receiver<Value> {
        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        {
            let mut request_id_to_callback = self.request_id_to_callback.lock().await;
            request_id_to_callback.insert(id.clone(), tx);
        }

        let _ = self.sender.send(JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }));
        rx
    }

    /// Route a response from the client back to the pending callback.
    pub async fn notify_client_response(&self, id: RequestId, result: Value) {
        let entry = {
            let mut request_id_to_callback = self.request_id_to_callback.lock().await;
            request_id_to_callback.remove_entry(&id)
        };

        match entry {
            Some((id, sender)) => {
                if sender.send(result).is_err() {
                    warn!("could not notify callback for {id:?}");
                }
            }
            None => {
                warn!("could not find callback for {id:?}");
            }
        }
    }

    pub async fn send_response<T: Serialize>(&self, id: RequestId, response: T) {
        let result = match serde_json::to_value(response) {
            Ok(result) => result,
            Err(err) => {
                self.send_error(
                    id,
                    JSONRPCErrorError {
                        code: onemcp_core::error::codes::INTERNAL_SERVER_ERROR,
                        message: format!("failed to serialize response: {err}"),
                        data: None,
                    },
                )
                .await;
                return;
            }
        };

        let _ = self.sender.send(JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }));
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) {
        let _ = self
            .sender
            .send(JSONRPCMessage::Notification(JSONRPCNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method: method.to_string(),
                params,
            }));
    }

    /// Push an already-built envelope (a reply produced by the message
    /// processor) onto the client stream.
    pub async fn send_message(&self, message: JSONRPCMessage) {
        let _ = self.sender.send(message);
    }

    pub async fn send_error(&self, id: RequestId, error: JSONRPCErrorError) {
        let _ = self.sender.send(JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn request_and_response_pair_up() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingMessageSender::new(tx);

        let callback = outgoing
            .send_request("sampling/createMessage", Some(json!({ "k": "v" })))
            .await;

        let sent = rx.recv().await.expect("request on channel");
        let JSONRPCMessage::Request(request) = sent else {
            panic!("expected request");
        };
        assert_eq!(request.method, "sampling/createMessage");

        outgoing
            .notify_client_response(request.id, json!({ "answer": 42 }))
            .await;
        let result = callback.await.expect("callback fired");
        assert_eq!(result, json!({ "answer": 42 }));
    }

    #[tokio::test]
    async fn responses_serialize_into_the_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingMessageSender::new(tx);
        outgoing
            .send_response(RequestId::Integer(7), json!({ "ok": true }))
            .await;

        let sent = rx.recv().await.expect("response on channel");
        assert_eq!(
            serde_json::to_value(&sent).expect("serialize"),
            json!({ "jsonrpc": "2.0", "id": 7, "result": { "ok": true } })
        );
    }
}
