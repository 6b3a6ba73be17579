//! Composite identifier codec.
//!
//! Tools, resources and prompts from the federation are exposed under
//! `<server-name>_1mcp_<inner-id>`. The separator is reserved: a composite id
//! is well-formed iff it contains the separator exactly once.

use crate::error::ProxyError;

/// Reserved separator between the outbound server name and the inner id.
pub const COMPOSITE_SEPARATOR: &str = "_1mcp_";

pub fn compose_id(server: &str, inner: &str) -> String {
    format!("{server}{COMPOSITE_SEPARATOR}{inner}")
}

/// Split a composite id into `(server, inner)`.
pub fn parse_id(id: &str) -> Result<(&str, &str), ProxyError> {
    let mut parts = id.splitn(2, COMPOSITE_SEPARATOR);
    let (Some(server), Some(inner)) = (parts.next(), parts.next()) else {
        return Err(ProxyError::invalid_request(format!(
            "id `{id}` is missing the `{COMPOSITE_SEPARATOR}` separator"
        )));
    };
    if server.is_empty() || inner.contains(COMPOSITE_SEPARATOR) {
        return Err(ProxyError::invalid_request(format!(
            "id `{id}` must contain `{COMPOSITE_SEPARATOR}` exactly once"
        )));
    }
    Ok((server, inner))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_when_separator_free() {
        let cases = [("math", "add"), ("files", "file:///tmp/x"), ("a-b_c", "t")];
        for (server, inner) in cases {
            let id = compose_id(server, inner);
            assert_eq!(parse_id(&id).ok(), Some((server, inner)));
        }
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(parse_id("plain-name").is_err());
    }

    #[test]
    fn rejects_double_separator() {
        let id = compose_id("srv", &compose_id("nested", "tool"));
        assert!(parse_id(&id).is_err());
    }

    #[test]
    fn rejects_empty_server_half() {
        assert!(parse_id("_1mcp_tool").is_err());
    }
}
