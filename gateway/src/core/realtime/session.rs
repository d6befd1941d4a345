//! Upstream session: owner of one outbound realtime WebSocket.
//!
//! The session exposes imperative operations (`send_text`, `append_audio`,
//! `commit_audio`, and friends) and a typed event feed the broker reads.
//! All frames, including keepalive pings and tool outputs, funnel through
//! one connection task that is the sole writer of the socket, so frame
//! ordering follows enqueue ordering.
//!
//! # State machine
//!
//! ```text
//! Connecting ── session.created ──▶ Ready ◀─── response.done ─── AwaitingResponse
//!     │                              │  ▲                              ▲
//!     │                     session.update sent                response.create sent
//!     │                              ▼  │
//!     │                           Updating (session.updated → Ready)
//!     └── timeout/error ──▶ Closed ◀── socket close / protocol error (terminal)
//! ```
//!
//! A closed session fails every operation with [`SessionError::SessionClosed`].
//! There is no auto-reconnect: the upstream losing the socket ends the
//! conversation, and the broker tears the client down in response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use xxhash_rust::xxh3::xxh3_64;

use super::config::{
    HANDSHAKE_TIMEOUT_SECS, KEEPALIVE_INTERVAL_SECS, Modality, UpstreamConfig,
};
use super::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, InstructionsUpdate, ResponseConfig,
    ServerEvent, SessionUpdate, ToolDef,
};
use crate::core::tools::ToolExecutor;

/// Channel capacity for outbound protocol frames.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for the per-session event feed.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// =============================================================================
// Errors
// =============================================================================

/// Errors from upstream session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake failed or did not complete within the deadline
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Operation on a session whose socket is gone
    #[error("session closed")]
    SessionClosed,

    /// The upstream reported a protocol error
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A `send_text_await` is already in flight on this session
    #[error("a response await is already pending")]
    AwaitPending,
}

// =============================================================================
// Event Feed
// =============================================================================

/// One event on a session's feed.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Owning session id; the feed never carries another session's events
    pub session_id: String,
    pub payload: EventPayload,
}

/// Typed payloads surfaced to the broker.
///
/// Function-call argument streams are consumed internally by the tool
/// executor and never appear here.
#[derive(Debug, Clone)]
pub enum EventPayload {
    SessionCreated,
    SessionUpdated,
    TextDelta { output_index: u32, delta: String },
    TextDone { output_index: u32 },
    AudioDelta { output_index: u32, delta: String },
    AudioDone { output_index: u32 },
    AudioTranscriptDelta { output_index: u32, delta: String },
    AudioTranscriptDone { output_index: u32 },
    ResponseDone { response: serde_json::Value },
    /// Upstream protocol error; terminal for the session
    Error {
        code: Option<String>,
        message: String,
        raw: serde_json::Value,
    },
    /// Upstream socket closed; terminal for the session
    Closed { code: u16, reason: String },
}

// =============================================================================
// State
// =============================================================================

/// Connection state of the upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    AwaitingResponse,
    Updating,
    Closed,
}

// =============================================================================
// Session
// =============================================================================

/// Commands consumed by the connection task.
enum Command {
    Frame(ClientEvent),
    Close,
}

/// In-flight `send_text_await` bookkeeping.
struct ResponseAwait {
    buffer: String,
    resolve: oneshot::Sender<Result<(String, serde_json::Value), SessionError>>,
}

/// A pending tool call being coalesced from argument deltas.
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// One outbound realtime session.
pub struct UpstreamSession {
    session_id: String,
    state: Arc<RwLock<SessionState>>,
    cmd_tx: mpsc::Sender<Command>,
    /// Hash of the last accepted instruction submission; gates duplicates
    instruction_hash: Mutex<u64>,
    pending_await: Arc<Mutex<Option<ResponseAwait>>>,
}

impl UpstreamSession {
    /// Open the upstream socket, submit the initial session configuration and
    /// return the session handle plus its event feed.
    pub async fn open(
        session_id: impl Into<String>,
        config: UpstreamConfig,
        tools: Arc<ToolExecutor>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>), SessionError> {
        let session_id = session_id.into();

        let mut request = config
            .ws_url()
            .into_client_request()
            .map_err(|e| SessionError::UpstreamUnavailable(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|_| SessionError::UpstreamUnavailable("invalid api key".to_string()))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            http::HeaderValue::from_static("realtime=v1"),
        );

        let handshake = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            connect_async(request),
        )
        .await;

        let (ws_stream, _response) = match handshake {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(SessionError::UpstreamUnavailable(e.to_string())),
            Err(_) => {
                return Err(SessionError::UpstreamUnavailable(format!(
                    "handshake did not complete within {HANDSHAKE_TIMEOUT_SECS}s"
                )));
            }
        };

        tracing::info!(session_id = %session_id, "upstream realtime socket connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let pending_await = Arc::new(Mutex::new(None));

        let session = Arc::new(Self {
            session_id: session_id.clone(),
            state: state.clone(),
            cmd_tx,
            instruction_hash: Mutex::new(0),
            pending_await: pending_await.clone(),
        });

        tokio::spawn(connection_task(
            session_id,
            ws_stream,
            cmd_rx,
            event_tx,
            state,
            pending_await,
            tools,
        ));

        // Initial session configuration goes through the same frame funnel as
        // every later operation, so it is the first frame on the wire.
        let instructions = config.instructions();
        session
            .send(ClientEvent::SessionUpdate {
                session: build_session_update(&config, &instructions),
            })
            .await?;
        *session.instruction_hash.lock().await = hash_instructions(&instructions);

        Ok((session, event_rx))
    }

    /// Id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of the connection state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Send a user text item and request a response with the given
    /// modalities.
    pub async fn send_text(
        &self,
        text: &str,
        modalities: &[Modality],
    ) -> Result<(), SessionError> {
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
        .await?;
        self.request_response(modalities).await
    }

    /// Append one base64 audio chunk to the upstream input buffer.
    pub async fn append_audio(&self, base64_chunk: String) -> Result<(), SessionError> {
        self.send(ClientEvent::InputAudioBufferAppend {
            audio: base64_chunk,
        })
        .await
    }

    /// Commit the audio buffer as one user turn and request a response.
    pub async fn commit_audio(&self, modalities: &[Modality]) -> Result<(), SessionError> {
        self.send(ClientEvent::InputAudioBufferCommit).await?;
        self.request_response(modalities).await
    }

    /// Discard the upstream input audio buffer.
    pub async fn clear_audio(&self) -> Result<(), SessionError> {
        self.send(ClientEvent::InputAudioBufferClear).await
    }

    /// Send a text-only turn and wait for the full response: resolves with
    /// the concatenated `response.text.delta` payloads and the raw
    /// `response.done` body. Fails with the upstream message on a protocol
    /// error.
    pub async fn send_text_await(
        &self,
        text: &str,
    ) -> Result<(String, serde_json::Value), SessionError> {
        let (resolve, rx) = oneshot::channel();
        {
            let mut slot = self.pending_await.lock().await;
            if slot.is_some() {
                return Err(SessionError::AwaitPending);
            }
            *slot = Some(ResponseAwait {
                buffer: String::new(),
                resolve,
            });
        }

        let sent = async {
            self.send(ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(text),
            })
            .await?;
            self.request_response(&[Modality::Text]).await
        }
        .await;

        if let Err(e) = sent {
            self.pending_await.lock().await.take();
            return Err(e);
        }

        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Submit new instructions unless they hash identically to the last
    /// accepted submission. Returns whether an update frame was sent.
    ///
    /// Updates are serialized per session by the hash lock, so two racing
    /// callers cannot both submit the same instructions.
    pub async fn maybe_update_instructions(
        &self,
        new_instructions: &str,
    ) -> Result<bool, SessionError> {
        let mut hash = self.instruction_hash.lock().await;
        let new_hash = hash_instructions(new_instructions);
        if *hash == new_hash {
            tracing::debug!(session_id = %self.session_id, "instructions unchanged, skipping session.update");
            return Ok(false);
        }

        self.send(ClientEvent::InstructionsUpdate {
            session: InstructionsUpdate {
                instructions: new_instructions.to_string(),
            },
        })
        .await?;
        *hash = new_hash;
        *self.state.write().await = SessionState::Updating;
        Ok(true)
    }

    /// Close the upstream socket. Idempotent; swallows frame-channel errors
    /// so teardown always completes.
    pub async fn close(&self) {
        *self.state.write().await = SessionState::Closed;
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    /// Enqueue a protocol frame, failing fast once the session is closed.
    async fn send(&self, event: ClientEvent) -> Result<(), SessionError> {
        if *self.state.read().await == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        self.cmd_tx
            .send(Command::Frame(event))
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    async fn request_response(&self, modalities: &[Modality]) -> Result<(), SessionError> {
        self.send(ClientEvent::ResponseCreate {
            response: Some(ResponseConfig {
                modalities: Some(Modality::list(modalities)),
            }),
        })
        .await?;
        *self.state.write().await = SessionState::AwaitingResponse;
        Ok(())
    }

    /// Closed handle with no socket behind it, for unit tests.
    #[cfg(test)]
    pub(crate) fn detached(session_id: &str, _config: UpstreamConfig) -> Arc<Self> {
        let (cmd_tx, _) = mpsc::channel(1);
        Arc::new(Self {
            session_id: session_id.to_string(),
            state: Arc::new(RwLock::new(SessionState::Closed)),
            cmd_tx,
            instruction_hash: Mutex::new(0),
            pending_await: Arc::new(Mutex::new(None)),
        })
    }
}

/// Stable hash over an instruction string. Not a security boundary; only a
/// duplicate-submission gate.
pub fn hash_instructions(instructions: &str) -> u64 {
    xxh3_64(instructions.as_bytes())
}

/// Initial `session.update` body for a new session.
fn build_session_update(config: &UpstreamConfig, instructions: &str) -> SessionUpdate {
    SessionUpdate {
        modalities: Some(Modality::list(&[Modality::Text, Modality::Audio])),
        instructions: Some(instructions.to_string()),
        input_audio_format: Some("pcm16".to_string()),
        output_audio_format: Some("pcm16".to_string()),
        input_audio_transcription: Some(InputAudioTranscription {
            model: config.transcription_model.clone(),
        }),
        // Client-driven turns: the caller commits each turn explicitly
        turn_detection: None,
        tools: Some(vec![ToolDef {
            tool_type: "function".to_string(),
            name: "rag_search".to_string(),
            description: Some(
                "상담 문서 저장소에서 질문과 관련된 자료를 검색합니다".to_string(),
            ),
            parameters: Some(UpstreamConfig::rag_search_parameters()),
        }]),
        tool_choice: Some("auto".to_string()),
        temperature: Some(config.temperature),
        max_response_output_tokens: Some(config.max_response_output_tokens),
    }
}

// =============================================================================
// Connection Task
// =============================================================================

/// The single owner of the upstream socket: drains outbound frames, reads
/// server events, runs the keepalive timer and dispatches tool calls.
async fn connection_task(
    session_id: String,
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    pending_await: Arc<Mutex<Option<ResponseAwait>>>,
    tools: Arc<ToolExecutor>,
) {
    let (mut sink, mut stream) = ws_stream.split();
    let mut keepalive =
        tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    // The first tick fires immediately; skip it so pings start one interval in
    keepalive.tick().await;

    let mut pending_tool_calls: HashMap<String, PendingToolCall> = HashMap::new();
    // Set once a terminal Error/Closed event has been emitted
    let mut terminal_emitted = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Frame(event)) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::error!(session_id = %session_id, "failed to serialize frame: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        tracing::warn!(session_id = %session_id, "upstream write failed: {e}");
                        emit(&event_tx, &session_id, EventPayload::Closed {
                            code: 1006,
                            reason: e.to_string(),
                        }).await;
                        terminal_emitted = true;
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let event = match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => event,
                        Err(_) => {
                            tracing::trace!(session_id = %session_id, "ignoring unhandled upstream event");
                            continue;
                        }
                    };
                    let flow = handle_server_event(
                        event,
                        &session_id,
                        &mut sink,
                        &event_tx,
                        &state,
                        &pending_await,
                        &mut pending_tool_calls,
                        &tools,
                    )
                    .await;
                    if flow.is_break() {
                        terminal_emitted = true;
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        tracing::warn!(session_id = %session_id, "pong failed: {e}");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (1005, String::new()),
                    };
                    tracing::info!(session_id = %session_id, code, "upstream closed the socket");
                    emit(&event_tx, &session_id, EventPayload::Closed { code, reason }).await;
                    terminal_emitted = true;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session_id, "upstream read error: {e}");
                    emit(&event_tx, &session_id, EventPayload::Closed {
                        code: 1006,
                        reason: e.to_string(),
                    }).await;
                    terminal_emitted = true;
                    break;
                }
                None => {
                    emit(&event_tx, &session_id, EventPayload::Closed {
                        code: 1006,
                        reason: "connection reset".to_string(),
                    }).await;
                    terminal_emitted = true;
                    break;
                }
            },

            _ = keepalive.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    tracing::warn!(session_id = %session_id, "keepalive ping failed: {e}");
                    emit(&event_tx, &session_id, EventPayload::Closed {
                        code: 1006,
                        reason: e.to_string(),
                    }).await;
                    terminal_emitted = true;
                    break;
                }
            }
        }
    }

    *state.write().await = SessionState::Closed;
    pending_tool_calls.clear();

    // A caller blocked in send_text_await must not hang on teardown
    if let Some(waiting) = pending_await.lock().await.take() {
        let _ = waiting.resolve.send(Err(SessionError::SessionClosed));
    }

    if terminal_emitted {
        tracing::debug!(session_id = %session_id, "upstream connection task ended");
    } else {
        tracing::debug!(session_id = %session_id, "upstream connection task closed locally");
    }
}

/// Handle one upstream server event. Returns `Break` when the event is
/// terminal for the session.
#[allow(clippy::too_many_arguments)]
async fn handle_server_event(
    event: ServerEvent,
    session_id: &str,
    sink: &mut WsSink,
    event_tx: &mpsc::Sender<SessionEvent>,
    state: &Arc<RwLock<SessionState>>,
    pending_await: &Arc<Mutex<Option<ResponseAwait>>>,
    pending_tool_calls: &mut HashMap<String, PendingToolCall>,
    tools: &Arc<ToolExecutor>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    match event {
        ServerEvent::SessionCreated { session } => {
            tracing::info!(
                session_id = %session_id,
                upstream_id = session.id.as_deref().unwrap_or("?"),
                "upstream session created"
            );
            *state.write().await = SessionState::Ready;
            emit(event_tx, session_id, EventPayload::SessionCreated).await;
        }

        ServerEvent::SessionUpdated { .. } => {
            *state.write().await = SessionState::Ready;
            emit(event_tx, session_id, EventPayload::SessionUpdated).await;
        }

        ServerEvent::TextDelta {
            output_index,
            delta,
        } => {
            if let Some(waiting) = pending_await.lock().await.as_mut() {
                waiting.buffer.push_str(&delta);
            }
            emit(
                event_tx,
                session_id,
                EventPayload::TextDelta {
                    output_index,
                    delta,
                },
            )
            .await;
        }

        ServerEvent::TextDone { output_index, .. } => {
            emit(event_tx, session_id, EventPayload::TextDone { output_index }).await;
        }

        ServerEvent::AudioTranscriptDelta {
            output_index,
            delta,
        } => {
            emit(
                event_tx,
                session_id,
                EventPayload::AudioTranscriptDelta {
                    output_index,
                    delta,
                },
            )
            .await;
        }

        ServerEvent::AudioTranscriptDone { output_index, .. } => {
            emit(
                event_tx,
                session_id,
                EventPayload::AudioTranscriptDone { output_index },
            )
            .await;
        }

        ServerEvent::AudioDelta {
            output_index,
            delta,
        } => {
            emit(
                event_tx,
                session_id,
                EventPayload::AudioDelta {
                    output_index,
                    delta,
                },
            )
            .await;
        }

        ServerEvent::AudioDone { output_index } => {
            emit(event_tx, session_id, EventPayload::AudioDone { output_index }).await;
        }

        ServerEvent::ResponseDone { response } => {
            *state.write().await = SessionState::Ready;
            if let Some(waiting) = pending_await.lock().await.take() {
                let _ = waiting
                    .resolve
                    .send(Ok((waiting.buffer, response.clone())));
            }
            emit(event_tx, session_id, EventPayload::ResponseDone { response }).await;
        }

        // Argument deltas are coalesced per call id in arrival order and
        // parsed only once the stream completes
        ServerEvent::FunctionCallArgumentsDelta {
            call_id,
            name,
            delta,
        } => {
            let entry = pending_tool_calls
                .entry(call_id)
                .or_insert_with(|| PendingToolCall {
                    name: name.unwrap_or_default(),
                    arguments: String::new(),
                });
            entry.arguments.push_str(&delta);
        }

        ServerEvent::FunctionCallArgumentsDone { call_id, arguments } => {
            let pending = pending_tool_calls.remove(&call_id);
            let (name, accumulated) = match pending {
                Some(p) => (p.name, p.arguments),
                None => (String::new(), String::new()),
            };
            // The done event's arguments win when present; otherwise the
            // coalesced deltas are the full argument string
            let args = arguments.unwrap_or(accumulated);

            let output = tools.dispatch(&call_id, &name, &args).await;
            tracing::debug!(
                session_id = %session_id,
                call_id = %call_id,
                tool = %name,
                "tool call dispatched"
            );

            let frame = ClientEvent::ToolOutput {
                tool_call_id: call_id,
                output: output.into_json(),
            };
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        tracing::warn!(session_id = %session_id, "tool output write failed: {e}");
                        emit(
                            event_tx,
                            session_id,
                            EventPayload::Closed {
                                code: 1006,
                                reason: e.to_string(),
                            },
                        )
                        .await;
                        return ControlFlow::Break(());
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, "failed to serialize tool output: {e}");
                }
            }
        }

        ServerEvent::Error { error } | ServerEvent::ResponseError { error } => {
            tracing::error!(
                session_id = %session_id,
                error_type = error.error_type.as_deref().unwrap_or("unknown"),
                "upstream protocol error: {}",
                error.message
            );
            if let Some(waiting) = pending_await.lock().await.take() {
                let _ = waiting
                    .resolve
                    .send(Err(SessionError::Upstream(error.message.clone())));
            }
            let raw = serde_json::to_value(&error).unwrap_or_default();
            emit(
                event_tx,
                session_id,
                EventPayload::Error {
                    code: error.code,
                    message: error.message,
                    raw,
                },
            )
            .await;
            return ControlFlow::Break(());
        }
    }

    ControlFlow::Continue(())
}

async fn emit(event_tx: &mpsc::Sender<SessionEvent>, session_id: &str, payload: EventPayload) {
    // A dropped receiver means the broker is already tearing down
    let _ = event_tx
        .send(SessionEvent {
            session_id: session_id.to_string(),
            payload,
        })
        .await;
}
