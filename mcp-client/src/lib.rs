//! Async MCP client used for the proxy's outbound connections.

mod mcp_client;

pub use mcp_client::ClientEvent;
pub use mcp_client::McpClient;
