//! Upstream realtime wire protocol.
//!
//! JSON events exchanged with the model service over the upstream WebSocket.
//!
//! Client events (sent upstream):
//! - session.update - session configuration and instruction updates
//! - input_audio_buffer.append / commit / clear - caller audio
//! - conversation.item.create - user text items
//! - response.create - request response generation
//! - tool.output - result of a gateway-executed tool call
//!
//! Server events (received):
//! - session.created / session.updated
//! - response.text.delta / done
//! - response.audio.delta / done
//! - response.audio_transcript.delta / done
//! - response.function_call_arguments.delta / done
//! - response.done
//! - error / response.error

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Session Configuration
// =============================================================================

/// `session.update` payload.
///
/// `turn_detection` is serialized even when `None`: the gateway runs a
/// client-driven turn policy, and the explicit `null` disables server VAD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Always present; `null` means turn boundaries are client-driven
    pub turn_detection: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

/// Instruction-only `session.update` payload. Skips `turn_detection`
/// entirely so a mid-session instruction change does not re-negotiate the
/// turn policy.
#[derive(Debug, Clone, Serialize)]
pub struct InstructionsUpdate {
    pub instructions: String,
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

/// Tool definition registered with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item for `conversation.item.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

impl ConversationItem {
    /// A `user` message holding a single `input_text` part.
    pub fn user_text(text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.to_string()),
            }]),
        }
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Response configuration for `response.create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
}

// =============================================================================
// Client Events (sent upstream)
// =============================================================================

/// Client events sent to the model service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Full session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    /// Instruction-only configuration update
    #[serde(rename = "session.update")]
    InstructionsUpdate { session: InstructionsUpdate },

    /// Append a base64 audio chunk to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Commit the input audio buffer as one user turn
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Discard the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Add an item to the conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Request response generation
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },

    /// Result of a gateway-executed tool call
    #[serde(rename = "tool.output")]
    ToolOutput { tool_call_id: String, output: String },
}

// =============================================================================
// Server Events (received)
// =============================================================================

/// Server events received from the model service.
///
/// Unknown event types are deserialization errors at the call site and are
/// logged and skipped by the session's read loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "response.error")]
    ResponseError { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated { session: UpstreamSessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<UpstreamSessionInfo>,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        output_index: u32,
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        text: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        output_index: u32,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        transcript: Option<String>,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        output_index: u32,
        /// Base64-encoded PCM16 audio
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        output_index: u32,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        arguments: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Value,
    },
}

/// Error payload of `error` / `response.error` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Session descriptor inside `session.created` / `session.updated`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSessionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_serializes_null_turn_detection() {
        let event = ClientEvent::SessionUpdate {
            session: SessionUpdate {
                modalities: Some(vec!["text".to_string(), "audio".to_string()]),
                turn_detection: None,
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"session.update""#));
        assert!(json.contains(r#""turn_detection":null"#));
    }

    #[test]
    fn test_instructions_update_omits_turn_detection() {
        let event = ClientEvent::InstructionsUpdate {
            session: InstructionsUpdate {
                instructions: "새 지침".to_string(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"session.update""#));
        assert!(json.contains("새 지침"));
        assert!(!json.contains("turn_detection"));
    }

    #[test]
    fn test_user_text_item() {
        let event = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("안녕"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["role"], "user");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "안녕");
    }

    #[test]
    fn test_tool_output_serialization() {
        let event = ClientEvent::ToolOutput {
            tool_call_id: "c1".to_string(),
            output: r#"{"count":1}"#.to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool.output");
        assert_eq!(json["tool_call_id"], "c1");
        assert_eq!(json["output"], r#"{"count":1}"#);
    }

    #[test]
    fn test_response_create_without_config() {
        let event = ClientEvent::ResponseCreate { response: None };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"response.create"}"#);
    }

    #[test]
    fn test_server_event_text_delta() {
        let json = r#"{"type":"response.text.delta","output_index":0,"delta":"안"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::TextDelta {
                output_index,
                delta,
            } => {
                assert_eq!(output_index, 0);
                assert_eq!(delta, "안");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_server_event_function_call_delta() {
        let json = r#"{
            "type": "response.function_call_arguments.delta",
            "call_id": "c1",
            "name": "rag_search",
            "delta": "{\"query\":"
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::FunctionCallArgumentsDelta { call_id, name, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name.as_deref(), Some("rag_search"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_server_event_error() {
        let json = r#"{"type":"error","error":{"type":"server_error","message":"boom"}}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.error_type.as_deref(), Some("server_error"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_server_event_is_parse_error() {
        let json = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert!(serde_json::from_str::<ServerEvent>(json).is_err());
    }
}
