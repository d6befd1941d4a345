//! Scriptable mock of the upstream realtime service.
//!
//! Accepts WebSocket connections, greets with `session.created`, answers
//! `session.update` with `session.updated`, records every received frame and
//! plays back scripted event turns on `response.create`. Tests can also
//! inject unsolicited events (tool calls, errors) or close the socket with a
//! chosen code.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use sonju_gateway::core::rag::{RetrievalError, Retriever, SearchOptions, Snippet, SnippetMetadata};

/// Commands a test can push to the live connection.
enum MockCmd {
    Event(Value),
    Close(u16, String),
}

struct MockShared {
    received: Mutex<Vec<Value>>,
    turns: Mutex<VecDeque<Vec<Value>>>,
    cmd_tx: Mutex<Vec<mpsc::UnboundedSender<MockCmd>>>,
}

/// Handle to a running mock upstream server.
pub struct MockUpstream {
    pub url: String,
    shared: Arc<MockShared>,
}

impl MockUpstream {
    /// Bind an ephemeral port and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local addr");

        let shared = Arc::new(MockShared {
            received: Mutex::new(Vec::new()),
            turns: Mutex::new(VecDeque::new()),
            cmd_tx: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(handle_connection(stream, shared));
            }
        });

        Self {
            url: format!("ws://{addr}/"),
            shared,
        }
    }

    /// Queue the server events played back on the next `response.create`.
    pub async fn push_turn(&self, events: Vec<Value>) {
        self.shared.turns.lock().await.push_back(events);
    }

    /// Send one unsolicited event to the connected session.
    pub async fn inject(&self, event: Value) {
        if let Some(tx) = self.shared.cmd_tx.lock().await.as_ref() {
            let _ = tx.send(MockCmd::Event(event));
        }
    }

    /// Close the live connection with the given close code.
    pub async fn close_connection(&self, code: u16, reason: &str) {
        if let Some(tx) = self.shared.cmd_tx.lock().await.as_ref() {
            let _ = tx.send(MockCmd::Close(code, reason.to_string()));
        }
    }

    /// Snapshot of all frames received so far.
    pub async fn received(&self) -> Vec<Value> {
        self.shared.received.lock().await.clone()
    }

    /// Frames of a given protocol type, in arrival order.
    pub async fn received_of_type(&self, frame_type: &str) -> Vec<Value> {
        self.received()
            .await
            .into_iter()
            .filter(|f| f["type"] == frame_type)
            .collect()
    }

    /// Wait until at least `n` frames have arrived, then return them all.
    pub async fn wait_for_frame_count(&self, n: usize, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frames = self.received().await;
            if frames.len() >= n {
                return frames;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n} upstream frames, got {}",
                frames.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `n` frames of one type have arrived.
    pub async fn wait_for_type_count(
        &self,
        frame_type: &str,
        n: usize,
        timeout: Duration,
    ) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frames = self.received_of_type(frame_type).await;
            if frames.len() >= n {
                return frames;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n} '{frame_type}' frames, got {}",
                frames.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<MockShared>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut stream) = ws.split();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    *shared.cmd_tx.lock().await = Some(cmd_tx);

    let greeting = json!({
        "type": "session.created",
        "session": {
            "id": "upstream_sess_1",
            "object": "realtime.session",
            "model": "gpt-4o-realtime-preview"
        }
    });
    let _ = sink.send(Message::Text(greeting.to_string().into())).await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(MockCmd::Event(event)) => {
                    let _ = sink.send(Message::Text(event.to_string().into())).await;
                }
                Some(MockCmd::Close(code, reason)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap_or_default();
                    let frame_type = value["type"].as_str().unwrap_or("").to_string();
                    shared.received.lock().await.push(value);

                    match frame_type.as_str() {
                        "session.update" => {
                            let reply = json!({
                                "type": "session.updated",
                                "session": { "id": "upstream_sess_1" }
                            });
                            let _ = sink.send(Message::Text(reply.to_string().into())).await;
                        }
                        "response.create" => {
                            let turn = shared.turns.lock().await.pop_front();
                            if let Some(events) = turn {
                                for event in events {
                                    let _ = sink
                                        .send(Message::Text(event.to_string().into()))
                                        .await;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    }
}

// =============================================================================
// Scripted Retriever
// =============================================================================

/// Retriever returning a fixed snippet list.
pub struct StaticRetriever {
    snippets: Vec<Snippet>,
}

impl StaticRetriever {
    pub fn new(snippets: Vec<Snippet>) -> Arc<Self> {
        Arc::new(Self { snippets })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn search(
        &self,
        _query: &str,
        _options: &SearchOptions,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        Ok(self.snippets.clone())
    }
}

/// Snippet literal for test scripts.
pub fn snippet(file_id: &str, score: f64, content: &str) -> Snippet {
    Snippet {
        content: content.to_string(),
        score,
        metadata: SnippetMetadata {
            source: "OpenAI Vector Store".to_string(),
            file_id: file_id.to_string(),
            filename: None,
        },
    }
}
