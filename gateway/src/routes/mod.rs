//! Route configuration.
//!
//! The gateway exposes a single WebSocket endpoint at `/`. Static assets,
//! health probes and documentation live in the HTTP wrapper fronting this
//! process.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::gateway_handler;
use crate::state::AppState;

/// Create the gateway router.
///
/// # Endpoint
///
/// `GET /` - WebSocket upgrade for the voice-assistant session
///
/// # Protocol
///
/// After upgrade, clients send binary PCM16 frames and channel-tagged JSON
/// envelopes; the server streams back `openai:conversation` deltas and
/// `openai:error` envelopes.
pub fn create_gateway_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(gateway_handler))
        .layer(TraceLayer::new_for_http())
}
