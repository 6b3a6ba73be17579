//! OAuth 2.1 gateway: file-backed artifact store, RFC 8414/9728 metadata,
//! RFC 7591 dynamic registration, and the authorize/token endpoints.

pub mod endpoints;
pub mod rate_limit;
pub mod store;
