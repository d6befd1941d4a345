//! HTTP middleware applied in front of the WebSocket upgrade.

pub mod connection_limit;

pub use connection_limit::{ClientIp, connection_limit_middleware};
