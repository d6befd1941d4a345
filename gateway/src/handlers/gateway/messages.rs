//! Client envelope protocol.
//!
//! Every JSON frame between the broker and a client carries a `channel`
//! routing key; conversation frames additionally carry a `type`. Binary
//! frames are raw PCM16 audio and bypass the envelope entirely.

use serde::Serialize;
use serde_json::{Value, json};

use crate::errors::GatewayError;

/// Conversation traffic with the upstream model.
pub const CHANNEL_CONVERSATION: &str = "openai:conversation";
/// Error envelopes.
pub const CHANNEL_ERROR: &str = "openai:error";
/// Synchronous summary requests.
pub const CHANNEL_SUMMARIZE: &str = "sonju:summarize";
/// Receive-only channel reserved for pushed question suggestions.
pub const CHANNEL_SUGGESTED_QUESTION: &str = "sonju:suggestedQuestion";
/// Receive-only channel reserved for pushed office information.
pub const CHANNEL_OFFICE_INFO: &str = "sonju:officeInfo";

/// Maximum accepted `input_text` payload (50 KB).
pub const MAX_TEXT_SIZE: usize = 50 * 1024;

/// Canned 1×1 transparent PNG returned for summary requests until a real
/// summarizer is wired up. The exact bytes are part of the client contract.
pub const SUMMARY_PLACEHOLDER_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

// =============================================================================
// Inbound
// =============================================================================

/// A routed inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Conversation(ConversationRequest),
    Summarize,
    /// Receive-only channels accept and drop inbound frames
    ReceiveOnly,
}

/// Conversation-channel requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRequest {
    /// `input_audio_buffer.commit`: reset the upstream buffer (idempotent)
    ClearAudio,
    /// `input_audio_buffer.end`: commit the buffer and request a response
    EndAudio,
    /// `input_audio_buffer.append` sent as text; audio must be binary
    AppendViaText,
    /// `input_text`
    InputText { text: String },
    /// `preprompted`: echoed back without upstream traffic
    Preprompted { option: String },
    /// Recognized channel, unhandled type
    Ignored,
}

/// Route one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, GatewayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::InvalidMessage(format!("invalid JSON: {e}")))?;

    let channel = value
        .get("channel")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            GatewayError::InvalidMessage("missing required field: channel".to_string())
        })?;

    match channel {
        CHANNEL_CONVERSATION => {
            let message_type = value.get("type").and_then(|t| t.as_str()).ok_or_else(|| {
                GatewayError::InvalidMessage("missing required field: type".to_string())
            })?;
            let request = match message_type {
                "input_audio_buffer.commit" => ConversationRequest::ClearAudio,
                "input_audio_buffer.end" => ConversationRequest::EndAudio,
                "input_audio_buffer.append" => ConversationRequest::AppendViaText,
                "input_text" => {
                    let text = value
                        .get("text")
                        .and_then(|t| t.as_str())
                        .ok_or_else(|| {
                            GatewayError::InvalidMessage(
                                "missing required field: text".to_string(),
                            )
                        })?;
                    if text.len() > MAX_TEXT_SIZE {
                        return Err(GatewayError::InvalidMessage(format!(
                            "text too large: {} bytes (max {} bytes)",
                            text.len(),
                            MAX_TEXT_SIZE
                        )));
                    }
                    ConversationRequest::InputText {
                        text: text.to_string(),
                    }
                }
                "preprompted" => ConversationRequest::Preprompted {
                    option: value
                        .get("enum")
                        .and_then(|e| e.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
                _ => ConversationRequest::Ignored,
            };
            Ok(Inbound::Conversation(request))
        }
        CHANNEL_SUMMARIZE => Ok(Inbound::Summarize),
        CHANNEL_SUGGESTED_QUESTION | CHANNEL_OFFICE_INFO => Ok(Inbound::ReceiveOnly),
        other => Err(GatewayError::UnknownChannel(other.to_string())),
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Conversation-channel events fanned out to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConversationEvent {
    #[serde(rename = "response.text.delta")]
    TextDelta { output_index: u32, delta: String },

    #[serde(rename = "response.text.done")]
    TextDone { output_index: u32 },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { output_index: u32, delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { output_index: u32 },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { output_index: u32, delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone { output_index: u32 },

    #[serde(rename = "preprompted.done")]
    PrepromptedDone { output: String },
}

/// Wrap a conversation event in its channel envelope.
pub fn conversation_envelope(event: ConversationEvent) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    value["channel"] = json!(CHANNEL_CONVERSATION);
    value
}

/// Summary reply carrying the placeholder image.
pub fn summary_envelope() -> Value {
    json!({
        "channel": CHANNEL_SUMMARIZE,
        "type": "summary.image",
        "image_base64": SUMMARY_PLACEHOLDER_PNG_BASE64,
    })
}

/// Error envelope for a gateway-side validation or lifecycle error.
pub fn gateway_error_envelope(error: &GatewayError) -> Value {
    json!({
        "channel": CHANNEL_ERROR,
        "code": error.code(),
        "message": error.to_string(),
    })
}

/// Error envelope for an upstream protocol error event.
pub fn upstream_error_envelope(code: Option<String>, message: &str, raw: &Value) -> Value {
    json!({
        "channel": CHANNEL_ERROR,
        "code": code.unwrap_or_else(|| "upstream_error".to_string()),
        "message": message,
        "raw": raw,
    })
}

/// Error envelope for an upstream socket close.
pub fn upstream_closed_envelope(code: u16, reason: &str) -> Value {
    json!({
        "channel": CHANNEL_ERROR,
        "code": code,
        "reason": reason,
    })
}
