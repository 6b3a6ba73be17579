//! Inbound surface of the onemcp proxy: the stdio session, the streamable
//! HTTP / SSE multiplexer, and the OAuth gateway.

pub mod http;
pub mod message_processor;
pub mod oauth;
pub mod outgoing_message;
pub mod proxy;
pub mod session;
pub mod stdio;
