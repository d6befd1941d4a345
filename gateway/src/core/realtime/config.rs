//! Upstream realtime session configuration.

use serde_json::json;

/// Upstream realtime WebSocket endpoint (without the `?model=` query).
pub const UPSTREAM_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Realtime model the gateway pins per session.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Model used to transcribe caller audio.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Sampling temperature for responses.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Output token cap per response. Voice answers are kept short.
pub const DEFAULT_MAX_RESPONSE_OUTPUT_TOKENS: u32 = 350;

/// Upstream handshake deadline.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 15;

/// Keepalive ping interval on the upstream socket.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 20;

/// Output modalities for generated responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    /// Text output
    Text,
    /// Audio output
    Audio,
}

impl Modality {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }

    /// Serialize a modality list for a protocol frame.
    pub fn list(modalities: &[Modality]) -> Vec<String> {
        modalities.iter().map(|m| m.as_str().to_string()).collect()
    }
}

/// Per-session upstream configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// API key for the upstream service
    pub api_key: String,
    /// WebSocket endpoint (without the `?model=` query)
    pub url: String,
    /// Realtime model
    pub model: String,
    /// Counseling domain the assistant serves, woven into instructions
    pub session_context: String,
    /// Delivery environment of the caller, woven into instructions
    pub audio_context: String,
    /// Transcription model for caller audio
    pub transcription_model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Output token cap per response
    pub max_response_output_tokens: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: UPSTREAM_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            session_context: String::new(),
            audio_context: String::new(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_response_output_tokens: DEFAULT_MAX_RESPONSE_OUTPUT_TOKENS,
        }
    }
}

impl UpstreamConfig {
    /// Full WebSocket URL with the model query parameter.
    pub fn ws_url(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }

    /// Assistant instructions for this session.
    pub fn instructions(&self) -> String {
        format!(
            "당신은 '{}' 상담을 담당하는 음성 도우미입니다. 현재 '{}' 환경에서 \
             대화하고 있습니다. 답변에 근거 문서가 필요하면 먼저 rag_search 도구를 \
             호출해 관련 자료를 확인한 뒤, 검색된 내용을 바탕으로 한국어로 짧고 \
             명확하게 답하세요. 확실하지 않은 내용은 추측하지 마세요.",
            self.session_context, self.audio_context
        )
    }

    /// JSON-schema parameter definition of the `rag_search` tool.
    pub fn rag_search_parameters() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "검색할 질문 또는 키워드"
                },
                "mode": {
                    "type": "string",
                    "enum": ["provisional", "final"],
                    "description": "provisional은 빠른 사전 확인, final은 답변용 검색"
                },
                "topK": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 5,
                    "default": 2
                },
                "threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1,
                    "default": 0.3
                }
            },
            "required": ["query"]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        let config = UpstreamConfig::default();
        assert_eq!(
            config.ws_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[test]
    fn test_instructions_embed_contexts() {
        let config = UpstreamConfig {
            session_context: "복지 상담".to_string(),
            audio_context: "웹 테스트".to_string(),
            ..Default::default()
        };
        let instructions = config.instructions();
        assert!(instructions.contains("복지 상담"));
        assert!(instructions.contains("웹 테스트"));
        assert!(instructions.contains("rag_search"));
    }

    #[test]
    fn test_modality_list() {
        assert_eq!(
            Modality::list(&[Modality::Text, Modality::Audio]),
            vec!["text".to_string(), "audio".to_string()]
        );
    }

    #[test]
    fn test_rag_search_parameters_schema() {
        let params = UpstreamConfig::rag_search_parameters();
        assert_eq!(params["required"][0], "query");
        assert_eq!(params["properties"]["topK"]["default"], 2);
        assert_eq!(params["properties"]["threshold"]["default"], 0.3);
    }
}
