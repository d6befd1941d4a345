//! WebSocket request handlers.
//!
//! - `gateway` - the client-facing broker: one WebSocket per caller, one
//!   upstream realtime session per WebSocket

pub mod gateway;

pub use gateway::gateway_handler;
