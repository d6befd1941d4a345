//! Upstream realtime session: the gateway side of the model service's
//! streaming WebSocket protocol.
//!
//! Each connected client owns exactly one [`UpstreamSession`]. The session
//! owns the outbound socket, serializes protocol frames, deserializes server
//! events into a typed per-session event feed, and runs the tool executor
//! for model-initiated `rag_search` calls.

pub mod config;
pub mod messages;
pub mod session;

pub use config::{
    DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL, Modality, UPSTREAM_REALTIME_URL,
    UpstreamConfig,
};
pub use messages::{ApiError, ClientEvent, ResponseConfig, ServerEvent, SessionUpdate, ToolDef};
pub use session::{EventPayload, SessionError, SessionEvent, SessionState, UpstreamSession};
