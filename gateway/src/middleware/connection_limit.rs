//! Connection caps enforced ahead of the WebSocket upgrade.
//!
//! Every accepted socket costs an upstream realtime session, so capacity is
//! checked before the upgrade completes: 503 once the server is at its
//! session cap, 429 once a single address holds too many. Rejections carry
//! the gateway's `openai:error` envelope as a JSON body so clients parse
//! them the same way as in-session errors.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::handlers::gateway::CHANNEL_ERROR;
use crate::state::{AppState, ConnectionLimitError};

/// Extension carrying the client IP into the handler so it can release the
/// slot on teardown.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Reserve a session slot for WebSocket upgrade requests, rejecting the
/// upgrade when the gateway is at capacity. Other requests pass through.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !wants_websocket(&request) {
        return next.run(request).await;
    }

    let ip = addr.ip();
    if let Err(reason) = state.try_acquire_connection(ip) {
        return reject(ip, reason);
    }

    // The gateway handler releases the slot during session teardown
    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}

fn wants_websocket(request: &Request<Body>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Envelope-shaped rejection, sent before any session exists.
fn reject(ip: IpAddr, reason: ConnectionLimitError) -> Response {
    let (status, message) = match reason {
        ConnectionLimitError::GlobalLimitReached => (
            StatusCode::SERVICE_UNAVAILABLE,
            "서버가 동시 상담 한도에 도달했습니다. 잠시 후 다시 연결해 주세요.",
        ),
        ConnectionLimitError::PerIpLimitReached => (
            StatusCode::TOO_MANY_REQUESTS,
            "같은 주소에서 열 수 있는 상담 연결 수를 초과했습니다.",
        ),
    };
    tracing::warn!(ip = %ip, status = status.as_u16(), "upgrade refused at capacity check");

    let envelope = json!({
        "channel": CHANNEL_ERROR,
        "code": status.as_u16(),
        "message": message,
    });
    (status, Json(envelope)).into_response()
}
