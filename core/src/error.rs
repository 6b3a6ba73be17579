//! Typed error taxonomy for the proxy.
//!
//! Every variant maps onto a JSON-RPC error code so inbound failures can be
//! answered without inspecting strings. Outbound protocol errors travel
//! through [`ProxyError::Protocol`] untouched.

use mcp_types::JSONRPCErrorError;
use serde_json::Value;

/// JSON-RPC error codes used on the inbound surface.
pub mod codes {
    pub const INTERNAL_SERVER_ERROR: i64 = -32000;
    pub const TRANSPORT_NOT_FOUND: i64 = -32001;
    pub const CLIENT_CONNECTION_ERROR: i64 = -32003;
    pub const RESOURCE_NOT_FOUND: i64 = -32004;
    pub const TOOL_NOT_FOUND: i64 = -32005;
    pub const PROMPT_NOT_FOUND: i64 = -32006;
    pub const OPERATION_TIMEOUT: i64 = -32007;
    pub const CAPABILITY_NOT_SUPPORTED: i64 = -32009;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

/// The entity kinds an addressed request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Resource,
    Tool,
    Prompt,
}

impl EntityKind {
    fn label(self) -> &'static str {
        match self {
            EntityKind::Resource => "resource",
            EntityKind::Tool => "tool",
            EntityKind::Prompt => "prompt",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to `{name}`: {message}")]
    ClientConnection { name: String, message: String },

    #[error("unknown outbound server `{name}`")]
    ClientNotFound { name: String },

    #[error("`{operation}` failed for `{name}`: {message}")]
    ClientOperation {
        name: String,
        operation: String,
        message: String,
    },

    #[error("transport error for `{name}`: {message}")]
    Transport { name: String, message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("{} `{name}` not found", .kind.label())]
    NotFound { kind: EntityKind, name: String },

    #[error("operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("server `{name}` does not support `{capability}`")]
    CapabilityNotSupported { name: String, capability: String },

    /// Requested tags are not covered by the granted OAuth scopes. The HTTP
    /// layer maps this onto `403 insufficient_scope`.
    #[error("tags not covered by granted scopes: {}", .tags.join(", "))]
    InsufficientScope { tags: Vec<String> },

    /// A protocol-level error from an outbound server, surfaced unchanged.
    #[error("upstream error {}: {}", .0.code, .0.message)]
    Protocol(JSONRPCErrorError),

    #[error("{message}")]
    Internal {
        message: String,
        data: Option<Value>,
    },
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Internal {
            message: "internal server error".to_string(),
            data: Some(Value::String(err.to_string())),
        }
    }
}

impl ProxyError {
    pub fn validation(message: impl Into<String>) -> Self {
        ProxyError::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        ProxyError::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal {
            message: message.into(),
            data: None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ProxyError::ClientConnection { .. } => codes::CLIENT_CONNECTION_ERROR,
            ProxyError::ClientNotFound { .. } => codes::TRANSPORT_NOT_FOUND,
            ProxyError::ClientOperation { .. } => codes::INTERNAL_SERVER_ERROR,
            ProxyError::Transport { .. } => codes::TRANSPORT_NOT_FOUND,
            ProxyError::Validation { .. } => codes::INVALID_PARAMS,
            ProxyError::InvalidRequest { .. } => codes::INVALID_PARAMS,
            ProxyError::NotFound { kind, .. } => match kind {
                EntityKind::Resource => codes::RESOURCE_NOT_FOUND,
                EntityKind::Tool => codes::TOOL_NOT_FOUND,
                EntityKind::Prompt => codes::PROMPT_NOT_FOUND,
            },
            ProxyError::Timeout { .. } => codes::OPERATION_TIMEOUT,
            ProxyError::CapabilityNotSupported { .. } => codes::CAPABILITY_NOT_SUPPORTED,
            ProxyError::InsufficientScope { .. } => codes::INVALID_PARAMS,
            ProxyError::Protocol(err) => err.code,
            ProxyError::Internal { .. } => codes::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures worth retrying: the transport broke or the call
    /// timed out. Protocol-level answers are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::Transport { .. } | ProxyError::Timeout { .. }
        )
    }

    /// Convert into the wire-level error object. Protocol errors pass
    /// through verbatim, everything else keeps its taxonomy code and a
    /// sanitized message.
    pub fn to_error_object(&self) -> JSONRPCErrorError {
        match self {
            ProxyError::Protocol(err) => err.clone(),
            other => JSONRPCErrorError {
                code: other.code(),
                message: other.to_string(),
                data: match other {
                    ProxyError::Internal { data, .. } => data.clone(),
                    _ => None,
                },
            },
        }
    }

    /// Wrap an untyped cause. Typed errors pass through; anything else
    /// becomes an internal error carrying the original message as data.
    pub fn wrap(cause: anyhow::Error) -> Self {
        match cause.downcast::<ProxyError>() {
            Ok(err) => err,
            Err(cause) => ProxyError::Internal {
                message: "internal server error".to_string(),
                data: Some(Value::String(format!("{cause:#}"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(
            ProxyError::ClientNotFound {
                name: "a".to_string()
            }
            .code(),
            codes::TRANSPORT_NOT_FOUND
        );
        assert_eq!(
            ProxyError::NotFound {
                kind: EntityKind::Tool,
                name: "t".to_string()
            }
            .code(),
            codes::TOOL_NOT_FOUND
        );
        assert_eq!(
            ProxyError::CapabilityNotSupported {
                name: "a".to_string(),
                capability: "tools".to_string()
            }
            .code(),
            codes::CAPABILITY_NOT_SUPPORTED
        );
    }

    #[test]
    fn protocol_errors_pass_through_unchanged() {
        let upstream = JSONRPCErrorError {
            code: -32601,
            message: "method not found".to_string(),
            data: None,
        };
        let err = ProxyError::Protocol(upstream.clone());
        assert_eq!(err.to_error_object(), upstream);
    }

    #[test]
    fn wrap_preserves_typed_errors() {
        let typed = ProxyError::Timeout { timeout_ms: 5 };
        let wrapped = ProxyError::wrap(anyhow::Error::new(typed));
        assert!(matches!(wrapped, ProxyError::Timeout { timeout_ms: 5 }));
    }

    #[test]
    fn wrap_hides_raw_causes_behind_internal() {
        let wrapped = ProxyError::wrap(anyhow::anyhow!("socket exploded"));
        let obj = wrapped.to_error_object();
        assert_eq!(obj.code, codes::INTERNAL_SERVER_ERROR);
        assert_eq!(obj.message, "internal server error");
        assert_eq!(
            obj.data,
            Some(serde_json::Value::String("socket exploded".to_string()))
        );
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(
            ProxyError::Transport {
                name: "a".to_string(),
                message: "reset".to_string()
            }
            .is_retryable()
        );
        assert!(ProxyError::Timeout { timeout_ms: 1 }.is_retryable());
        assert!(
            !ProxyError::Protocol(JSONRPCErrorError {
                code: -1,
                message: String::new(),
                data: None
            })
            .is_retryable()
        );
        assert!(!ProxyError::validation("bad").is_retryable());
    }
}
