//! Broker WebSocket handler.
//!
//! One task per client connection owns the whole session: it reads client
//! frames, reads the upstream event feed, and runs the heartbeat timer in a
//! single select loop, so teardown is a straight-line path at the bottom of
//! the function. All socket writes funnel through a dedicated writer task;
//! the client socket, like the upstream one, has exactly one writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::audio::{AUDIO_CHUNK_SIZE, to_base64_chunks};
use crate::core::realtime::{
    EventPayload, Modality, SessionEvent, UpstreamConfig, UpstreamSession,
};
use crate::core::tools::ToolExecutor;
use crate::errors::GatewayError;
use crate::middleware::ClientIp;
use crate::registry::SessionEntry;
use crate::state::AppState;

use super::messages::{
    ConversationEvent, ConversationRequest, Inbound, conversation_envelope,
    gateway_error_envelope, parse_inbound, summary_envelope, upstream_closed_envelope,
    upstream_error_envelope,
};

/// Channel capacity for outbound client frames.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Client heartbeat interval; one missed pong terminates the connection.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Counseling domain every session is opened with.
const SESSION_CONTEXT: &str = "복지 상담";

/// Delivery environment every session is opened with.
const AUDIO_CONTEXT: &str = "웹 테스트";

/// Frames routed through the client writer task.
enum Outbound {
    Envelope(Value),
    Ping,
    Close,
}

/// Gateway WebSocket handler: upgrades the connection and hands it to the
/// session loop.
pub async fn gateway_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    let client_ip = client_ip.map(|Extension(ClientIp(ip))| ip);
    ws.on_upgrade(move |socket| handle_gateway_socket(socket, state, client_ip))
}

/// Drive one client connection from accept to teardown.
async fn handle_gateway_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client_ip: Option<std::net::IpAddr>,
) {
    let session_id = new_session_id();
    info!(session_id = %session_id, "client connected");

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CHANNEL_CAPACITY);

    // Single writer of the client socket
    let writer_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let result = match out {
                Outbound::Envelope(value) => match serde_json::to_string(&value) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!("failed to serialize client envelope: {e}");
                        continue;
                    }
                },
                Outbound::Ping => sender.send(Message::Ping(Bytes::new())).await,
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // One upstream session per client, opened before any frame is accepted
    let upstream_config = UpstreamConfig {
        api_key: state.config.openai_api_key.clone(),
        url: state.config.realtime_url.clone(),
        session_context: SESSION_CONTEXT.to_string(),
        audio_context: AUDIO_CONTEXT.to_string(),
        ..Default::default()
    };
    let tools = Arc::new(ToolExecutor::new(state.retriever.clone()));

    let (session, mut events) =
        match UpstreamSession::open(session_id.clone(), upstream_config, tools).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(session_id = %session_id, "upstream open failed: {e}");
                let error = GatewayError::UpstreamUnavailable(e.to_string());
                let _ = out_tx
                    .send(Outbound::Envelope(gateway_error_envelope(&error)))
                    .await;
                let _ = out_tx.send(Outbound::Close).await;
                let _ = writer_task.await;
                if let Some(ip) = client_ip {
                    state.release_connection(ip);
                }
                return;
            }
        };

    if let Err(e) = state
        .registry
        .insert(&session_id, SessionEntry::new(session.clone()))
    {
        // Id collision is vanishingly rare; treat it as a failed accept
        warn!(session_id = %session_id, "registry insert failed: {e}");
        session.close().await;
        let _ = out_tx.send(Outbound::Close).await;
        let _ = writer_task.await;
        if let Some(ip) = client_ip {
            state.release_connection(ip);
        }
        return;
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.tick().await;
    let mut pong_received = true;

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !handle_text_frame(&text, &session, &out_tx).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let paused = state
                        .registry
                        .lookup(&session_id)
                        .map(|e| e.is_paused())
                        .unwrap_or(true);
                    if paused {
                        debug!(session_id = %session_id, "dropping audio on paused session");
                        continue;
                    }
                    if !handle_audio_frame(&data, &session, &out_tx).await {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    pong_received = true;
                }
                Some(Ok(Message::Ping(_))) => {
                    // Answered by the WebSocket layer
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id = %session_id, "client disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "client socket error: {e}");
                    break;
                }
            },

            event = events.recv() => match event {
                Some(event) => {
                    if !forward_upstream_event(event, &session_id, &out_tx).await {
                        break;
                    }
                }
                None => {
                    // Feed closed without a terminal event; treat as upstream loss
                    let _ = out_tx
                        .send(Outbound::Envelope(upstream_closed_envelope(
                            1006,
                            "upstream connection lost",
                        )))
                        .await;
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if !pong_received {
                    warn!(session_id = %session_id, "client missed heartbeat, terminating");
                    break;
                }
                pong_received = false;
                if out_tx.send(Outbound::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    // Deterministic teardown: stop audio, close upstream (errors swallowed),
    // drop the registry entry, then close the client socket
    if let Some(entry) = state.registry.lookup(&session_id) {
        entry.set_paused(true);
    }
    session.close().await;
    state.registry.remove(&session_id);
    drop(events);

    let _ = out_tx.send(Outbound::Close).await;
    drop(out_tx);
    let _ = writer_task.await;

    if let Some(ip) = client_ip {
        state.release_connection(ip);
    }
    info!(session_id = %session_id, "session torn down");
}

/// Handle one inbound text frame. Returns false when the connection must
/// close.
async fn handle_text_frame(
    text: &str,
    session: &Arc<UpstreamSession>,
    out_tx: &mpsc::Sender<Outbound>,
) -> bool {
    let inbound = match parse_inbound(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!("rejecting inbound frame: {e}");
            let _ = out_tx
                .send(Outbound::Envelope(gateway_error_envelope(&e)))
                .await;
            return true;
        }
    };

    match inbound {
        Inbound::Conversation(request) => match request {
            ConversationRequest::ClearAudio => {
                session_op(session.clear_audio().await, out_tx).await
            }
            ConversationRequest::EndAudio => {
                session_op(
                    session
                        .commit_audio(&[Modality::Text, Modality::Audio])
                        .await,
                    out_tx,
                )
                .await
            }
            ConversationRequest::InputText { text } => {
                session_op(
                    session
                        .send_text(&text, &[Modality::Text, Modality::Audio])
                        .await,
                    out_tx,
                )
                .await
            }
            ConversationRequest::AppendViaText => {
                let error = GatewayError::InvalidMessage(
                    "input_audio_buffer.append must be a binary frame".to_string(),
                );
                let _ = out_tx
                    .send(Outbound::Envelope(gateway_error_envelope(&error)))
                    .await;
                true
            }
            ConversationRequest::Preprompted { option } => {
                let _ = out_tx
                    .send(Outbound::Envelope(conversation_envelope(
                        ConversationEvent::PrepromptedDone { output: option },
                    )))
                    .await;
                true
            }
            ConversationRequest::Ignored => true,
        },
        Inbound::Summarize => {
            let _ = out_tx.send(Outbound::Envelope(summary_envelope())).await;
            true
        }
        Inbound::ReceiveOnly => true,
    }
}

/// Handle one inbound binary audio frame. Returns false when the connection
/// must close.
async fn handle_audio_frame(
    data: &[u8],
    session: &Arc<UpstreamSession>,
    out_tx: &mpsc::Sender<Outbound>,
) -> bool {
    let chunks = match to_base64_chunks(data, AUDIO_CHUNK_SIZE) {
        Ok(chunks) => chunks,
        Err(e) => {
            let error = GatewayError::InvalidAudio(e.to_string());
            let _ = out_tx
                .send(Outbound::Envelope(gateway_error_envelope(&error)))
                .await;
            return true;
        }
    };

    for chunk in chunks {
        if !session_op(session.append_audio(chunk).await, out_tx).await {
            return false;
        }
    }
    true
}

/// Map an upstream-session operation result onto the client connection:
/// success keeps going, failure (the upstream is gone) reports and closes.
async fn session_op(
    result: Result<(), crate::core::realtime::SessionError>,
    out_tx: &mpsc::Sender<Outbound>,
) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("upstream operation failed: {e}");
            let _ = out_tx
                .send(Outbound::Envelope(gateway_error_envelope(
                    &GatewayError::SessionClosed,
                )))
                .await;
            false
        }
    }
}

/// Translate one upstream event into its client envelope. Returns false on a
/// terminal event.
async fn forward_upstream_event(
    event: SessionEvent,
    session_id: &str,
    out_tx: &mpsc::Sender<Outbound>,
) -> bool {
    // The feed is per-session by construction; anything else is a bug
    debug_assert_eq!(event.session_id, session_id);

    let envelope = match event.payload {
        EventPayload::TextDelta {
            output_index,
            delta,
        } => Some(conversation_envelope(ConversationEvent::TextDelta {
            output_index,
            delta,
        })),
        EventPayload::TextDone { output_index } => Some(conversation_envelope(
            ConversationEvent::TextDone { output_index },
        )),
        EventPayload::AudioTranscriptDelta {
            output_index,
            delta,
        } => Some(conversation_envelope(
            ConversationEvent::AudioTranscriptDelta {
                output_index,
                delta,
            },
        )),
        EventPayload::AudioTranscriptDone { output_index } => Some(conversation_envelope(
            ConversationEvent::AudioTranscriptDone { output_index },
        )),
        EventPayload::AudioDelta {
            output_index,
            delta,
        } => Some(conversation_envelope(ConversationEvent::AudioDelta {
            output_index,
            delta,
        })),
        EventPayload::AudioDone { output_index } => Some(conversation_envelope(
            ConversationEvent::AudioDone { output_index },
        )),

        // Session lifecycle and response boundaries stay internal
        EventPayload::SessionCreated
        | EventPayload::SessionUpdated
        | EventPayload::ResponseDone { .. } => None,

        EventPayload::Error { code, message, raw } => {
            let _ = out_tx
                .send(Outbound::Envelope(upstream_error_envelope(
                    code, &message, &raw,
                )))
                .await;
            return false;
        }
        EventPayload::Closed { code, reason } => {
            let _ = out_tx
                .send(Outbound::Envelope(upstream_closed_envelope(code, &reason)))
                .await;
            return false;
        }
    };

    if let Some(envelope) = envelope {
        let _ = out_tx.send(Outbound::Envelope(envelope)).await;
    }
    true
}

/// Mint a `sonj_<epoch_ms>_<base36>` session id. Ids need uniqueness, not
/// unpredictability, so a counter-salted LCG over the clock suffices.
fn new_session_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut seed = (now.as_nanos() as u64)
        ^ COUNTER
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);

    let suffix: String = (0..6)
        .map(|_| {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ALPHABET[((seed >> 33) % 36) as usize] as char
        })
        .collect();

    format!("sonj_{}_{}", now.as_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = new_session_id();
        let mut parts = id.splitn(3, '_');
        assert_eq!(parts.next(), Some("sonj"));

        let millis = parts.next().unwrap();
        assert!(millis.parse::<u128>().is_ok());

        let suffix = parts.next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| new_session_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
