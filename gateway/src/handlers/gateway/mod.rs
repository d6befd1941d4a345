//! Client gateway (broker).
//!
//! Accepts client WebSockets, opens one upstream session per client, routes
//! inbound frames (binary audio, channel-tagged JSON) and fans upstream
//! events back out as channel envelopes.

pub mod handler;
pub mod messages;

pub use handler::gateway_handler;
pub use messages::{
    CHANNEL_CONVERSATION, CHANNEL_ERROR, CHANNEL_OFFICE_INFO, CHANNEL_SUGGESTED_QUESTION,
    CHANNEL_SUMMARIZE,
};
