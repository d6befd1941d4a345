//! Client-facing error taxonomy.
//!
//! Every error that reaches a connected client is reduced to a numeric code
//! plus a human-readable message and sent as an `openai:error` envelope.
//! Per-frame validation errors are local: the session keeps running. Upstream
//! failures are fatal for that session only.

use thiserror::Error;

/// Errors surfaced to a connected client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Mis-aligned or empty PCM16 payload in a binary frame
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// Malformed JSON or a frame missing `channel`/`type`
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Routing key the broker does not know
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Operation attempted on a closed upstream session
    #[error("session closed")]
    SessionClosed,

    /// Upstream handshake failed or timed out
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream emitted a protocol error event
    #[error("upstream error: {0}")]
    UpstreamError(String),
}

impl GatewayError {
    /// Numeric code carried in the `openai:error` envelope.
    pub fn code(&self) -> u16 {
        match self {
            GatewayError::InvalidAudio(_)
            | GatewayError::InvalidMessage(_)
            | GatewayError::UnknownChannel(_) => 400,
            GatewayError::SessionClosed => 410,
            GatewayError::UpstreamUnavailable(_) => 503,
            GatewayError::UpstreamError(_) => 502,
        }
    }

    /// Whether the owning session survives this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::SessionClosed
                | GatewayError::UpstreamUnavailable(_)
                | GatewayError::UpstreamError(_)
        )
    }
}
