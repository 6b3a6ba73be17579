//! Turns inbound JSON-RPC messages into dispatcher calls and reply
//! envelopes.
//!
//! One processor exists per inbound session. Requests produce a reply
//! envelope the transport delivers (POST body for streamable HTTP, event
//! stream for SSE, stdout for stdio); notifications fan out to the
//! federation; responses resolve proxy-initiated requests such as forwarded
//! sampling.

use std::sync::Arc;

use mcp_types::GetPromptRequestParams;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::Implementation;
use mcp_types::InitializedNotification;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListPromptsRequestParams;
use mcp_types::ListResourceTemplatesRequestParams;
use mcp_types::ListResourcesRequestParams;
use mcp_types::ListToolsRequestParams;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::SetLevelRequestParams;
use onemcp_core::config::PROXY_SERVER_NAME;
use onemcp_core::dispatcher::Dispatcher;
use onemcp_core::dispatcher::RequestContext;
use onemcp_core::error::ProxyError;
use onemcp_core::error::codes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::error;

use crate::session::InboundSession;

pub struct MessageProcessor {
    session: Arc<InboundSession>,
    dispatcher: Arc<Dispatcher>,
}

impl MessageProcessor {
    pub fn new(session: Arc<InboundSession>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            session,
            dispatcher,
        }
    }

    /// Handle one inbound message. Requests yield a reply envelope; the
    /// other variants yield nothing.
    pub async fn process(&mut self, message: JSONRPCMessage) -> Option<JSONRPCMessage> {
        match message {
            JSONRPCMessage::Request(request) => Some(self.process_request(request).await),
            JSONRPCMessage::Notification(notification) => {
                self.process_notification(notification).await;
                None
            }
            JSONRPCMessage::Response(JSONRPCResponse { id, result, .. }) => {
                self.session
                    .outgoing
                    .notify_client_response(id, result)
                    .await;
                None
            }
            JSONRPCMessage::Error(err) => {
                error!("<- error from client: {:?}", err.error);
                None
            }
        }
    }

    async fn process_request(&mut self, request: JSONRPCRequest) -> JSONRPCMessage {
        let id = request.id.clone();
        match self.handle_request(request).await {
            Ok(result) => JSONRPCMessage::Response(JSONRPCResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result,
            }),
            Err(err) => JSONRPCMessage::Error(JSONRPCError {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                error: err.to_error_object(),
            }),
        }
    }

    async fn handle_request(&mut self, request: JSONRPCRequest) -> Result<Value, ProxyError> {
        let JSONRPCRequest { method, params, .. } = request;
        debug!("{method} -> params: {params:?}");

        if method == "initialize" {
            return self.handle_initialize(parse_params(params)?);
        }

        let ctx = self.context();
        match method.as_str() {
            "ping" => Ok(self.dispatcher.ping()),
            "tools/list" => {
                let params: Option<ListToolsRequestParams> = parse_params(params)?;
                let result = self
                    .dispatcher
                    .list_tools(&ctx, params.and_then(|p| p.cursor))
                    .await?;
                to_value(result)
            }
            "tools/call" => self.dispatcher.call_tool(&ctx, parse_params(params)?).await,
            "resources/list" => {
                let params: Option<ListResourcesRequestParams> = parse_params(params)?;
                let result = self
                    .dispatcher
                    .list_resources(&ctx, params.and_then(|p| p.cursor))
                    .await?;
                to_value(result)
            }
            "resources/templates/list" => {
                let params: Option<ListResourceTemplatesRequestParams> = parse_params(params)?;
                let result = self
                    .dispatcher
                    .list_resource_templates(&ctx, params.and_then(|p| p.cursor))
                    .await?;
                to_value(result)
            }
            "resources/read" => {
                self.dispatcher
                    .read_resource(&ctx, parse_params(params)?)
                    .await
            }
            "resources/subscribe" => {
                self.dispatcher
                    .subscribe_resource(&ctx, parse_params(params)?)
                    .await
            }
            "resources/unsubscribe" => {
                self.dispatcher
                    .unsubscribe_resource(&ctx, parse_params(params)?)
                    .await
            }
            "prompts/list" => {
                let params: Option<ListPromptsRequestParams> = parse_params(params)?;
                let result = self
                    .dispatcher
                    .list_prompts(&ctx, params.and_then(|p| p.cursor))
                    .await?;
                to_value(result)
            }
            "prompts/get" => {
                let params: GetPromptRequestParams = parse_params(params)?;
                self.dispatcher.get_prompt(&ctx, params).await
            }
            "logging/setLevel" => {
                let params: SetLevelRequestParams = parse_params(params)?;
                Ok(self.dispatcher.set_level(params).await)
            }
            "completion/complete" => {
                self.dispatcher
                    .complete(&ctx, params.unwrap_or(Value::Null))
                    .await
            }
            other => Err(ProxyError::Protocol(mcp_types::JSONRPCErrorError {
                code: codes::METHOD_NOT_FOUND,
                message: format!("method not found: {other}"),
                data: Some(serde_json::json!({ "method": other })),
            })),
        }
    }

    fn handle_initialize(
        &mut self,
        params: InitializeRequestParams,
    ) -> Result<Value, ProxyError> {
        if !self.session.mark_initialized() {
            return Err(ProxyError::invalid_request(
                "initialize called more than once",
            ));
        }

        let client = params.client_info;
        debug!(
            "inbound session {} initialized by {} {}",
            self.session.id, client.name, client.version
        );

        let result = InitializeResult {
            capabilities: self.dispatcher.manager().aggregated_capabilities(),
            instructions: None,
            protocol_version: params.protocol_version,
            server_info: Implementation {
                name: PROXY_SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("onemcp aggregating proxy".to_string()),
            },
        };
        to_value(result)
    }

    async fn process_notification(&mut self, notification: JSONRPCNotification) {
        if notification.method == InitializedNotification::METHOD {
            debug!("inbound session {} sent initialized", self.session.id);
            return;
        }
        // Every other client-to-server notification goes to the whole
        // connected federation.
        self.dispatcher
            .broadcast_notification(
                &notification.method,
                notification.params.unwrap_or(Value::Null),
            )
            .await;
    }

    fn context(&self) -> RequestContext {
        RequestContext {
            session_id: self.session.id.clone(),
            filter: self.session.filter(),
            pagination: self.session.pagination,
            retry: Default::default(),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ProxyError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| ProxyError::invalid_request(format!("invalid params: {err}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, ProxyError> {
    serde_json::to_value(value)
        .map_err(|err| ProxyError::internal(format!("failed to serialize result: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mcp_types::RequestId;
    use onemcp_core::filter::FilterContext;
    use onemcp_core::outbound::OutboundManager;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn processor() -> MessageProcessor {
        let (manager, _events) = OutboundManager::new(PROXY_SERVER_NAME.to_string());
        let dispatcher = Arc::new(Dispatcher::new(manager));
        let session =
            InboundSession::new("test".to_string(), FilterContext::None, None, false);
        MessageProcessor::new(session, dispatcher)
    }

    fn request(method: &str, params: Option<Value>) -> JSONRPCMessage {
        JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Integer(1),
            method: method.to_string(),
            params,
        })
    }

    #[tokio::test]
    async fn initialize_reports_proxy_identity() {
        let mut processor = processor();
        let reply = processor
            .process(request(
                "initialize",
                Some(json!({
                    "capabilities": {},
                    "clientInfo": { "name": "test-client", "version": "1.0" },
                    "protocolVersion": "2025-06-18"
                })),
            ))
            .await
            .expect("reply");

        let JSONRPCMessage::Response(response) = reply else {
            panic!("expected response, got {reply:?}");
        };
        assert_eq!(response.result["serverInfo"]["name"], "1mcp");
        assert_eq!(response.result["protocolVersion"], "2025-06-18");
    }

    #[tokio::test]
    async fn double_initialize_is_rejected() {
        let mut processor = processor();
        let init = json!({
            "capabilities": {},
            "clientInfo": { "name": "c", "version": "1" },
            "protocolVersion": "2025-06-18"
        });
        processor
            .process(request("initialize", Some(init.clone())))
            .await;
        let reply = processor
            .process(request("initialize", Some(init)))
            .await
            .expect("reply");
        assert!(matches!(reply, JSONRPCMessage::Error(_)));
    }

    #[tokio::test]
    async fn unknown_methods_get_method_not_found() {
        let mut processor = processor();
        let reply = processor
            .process(request("tasks/list", None))
            .await
            .expect("reply");
        let JSONRPCMessage::Error(err) = reply else {
            panic!("expected error");
        };
        assert_eq!(err.error.code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn ping_answers_locally() {
        let mut processor = processor();
        let reply = processor.process(request("ping", None)).await.expect("reply");
        let JSONRPCMessage::Response(response) = reply else {
            panic!("expected response");
        };
        assert_eq!(response.result, json!({}));
    }

    #[tokio::test]
    async fn list_tools_on_empty_federation_is_empty() {
        let mut processor = processor();
        let reply = processor
            .process(request("tools/list", None))
            .await
            .expect("reply");
        let JSONRPCMessage::Response(response) = reply else {
            panic!("expected response");
        };
        assert_eq!(response.result, json!({ "tools": [] }));
    }

    #[tokio::test]
    async fn addressed_call_with_bad_id_is_invalid_params() {
        let mut processor = processor();
        let reply = processor
            .process(request("tools/call", Some(json!({ "name": "no-separator" }))))
            .await
            .expect("reply");
        let JSONRPCMessage::Error(err) = reply else {
            panic!("expected error");
        };
        assert_eq!(err.error.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn addressed_call_to_unknown_server_is_transport_not_found() {
        let mut processor = processor();
        let reply = processor
            .process(request(
                "tools/call",
                Some(json!({ "name": "ghost_1mcp_add" })),
            ))
            .await
            .expect("reply");
        let JSONRPCMessage::Error(err) = reply else {
            panic!("expected error");
        };
        assert_eq!(err.error.code, codes::TRANSPORT_NOT_FOUND);
    }
}
