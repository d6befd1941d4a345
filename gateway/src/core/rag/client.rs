//! Vector-store retrieval client.
//!
//! Retrieval goes through a file-search-capable model endpoint: the client
//! submits a search instruction with the vector store attached and constrains
//! the reply to a strict JSON schema of scored snippets. When the structured
//! reply cannot be parsed, `file_citation` annotations on the free-text
//! output are mined as a fallback.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Vector store holding the counseling document corpus.
pub const VECTOR_STORE_ID: &str = "vs_680f2a9c1b48191b7e3d5c2a94e6f017";

/// Model used to execute file-search retrieval.
const RETRIEVAL_MODEL: &str = "gpt-4o-mini";

/// Request timeout for retrieval calls.
const RETRIEVAL_TIMEOUT_SECS: u64 = 30;

/// Source label attached to snippets from the vector store.
const SNIPPET_SOURCE: &str = "OpenAI Vector Store";

// =============================================================================
// Types
// =============================================================================

/// Retrieval errors.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Transport-level failure
    #[error("retrieval request failed: {0}")]
    Http(String),

    /// Non-success status from the API
    #[error("retrieval API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match any known shape
    #[error("malformed retrieval response: {0}")]
    Malformed(String),
}

/// Search parameters, already normalized by the tool executor.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Maximum number of snippets to return
    pub top_k: usize,
    /// Minimum score a snippet must reach
    pub threshold: f64,
    /// Maximum snippet length in characters
    pub max_chars: usize,
}

/// One scored document snippet.
#[derive(Debug, Clone)]
pub struct Snippet {
    /// Snippet text, truncated at the caller's character budget
    pub content: String,
    /// Relevance score in [0, 1]; 0 when the backend reported none
    pub score: f64,
    pub metadata: SnippetMetadata,
}

/// Source attribution for a snippet.
#[derive(Debug, Clone)]
pub struct SnippetMetadata {
    pub source: String,
    pub file_id: String,
    pub filename: Option<String>,
}

/// Retrieval backend seam. The production implementation talks to the vector
/// store; tests substitute a scripted backend.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Snippet>, RetrievalError>;
}

// =============================================================================
// Formatting
// =============================================================================

/// Render snippets into the context block handed to the model: one
/// `[출처: <file>]` header per snippet, blank-line separated.
pub fn format_context(snippets: &[Snippet]) -> String {
    snippets
        .iter()
        .map(|s| {
            let source = if s.metadata.file_id.is_empty() {
                s.metadata.source.as_str()
            } else {
                s.metadata.file_id.as_str()
            };
            format!("[출처: {}]\n{}", source, s.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Structured rendering: source ids, contents and the joined context block.
pub fn format_structured(snippets: &[Snippet]) -> (Vec<String>, Vec<String>, String) {
    let sources = snippets
        .iter()
        .map(|s| s.metadata.file_id.clone())
        .collect();
    let contents = snippets.iter().map(|s| s.content.clone()).collect();
    let context = format_context(snippets);
    (sources, contents, context)
}

/// Truncate at a character budget, appending an ellipsis marker when content
/// was dropped.
fn truncate_content(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

// =============================================================================
// Wire Shapes
// =============================================================================

/// Structured retrieval reply the model is constrained to.
#[derive(Debug, Deserialize)]
struct RagResults {
    #[serde(default)]
    results: Vec<RagResult>,
}

#[derive(Debug, Deserialize)]
struct RagResult {
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    text: String,
}

// =============================================================================
// Client
// =============================================================================

/// Retrieval client backed by the OpenAI Responses API with `file_search`.
pub struct VectorStoreClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    vector_store_id: String,
}

impl VectorStoreClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(RETRIEVAL_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            vector_store_id: VECTOR_STORE_ID.to_string(),
        }
    }

    /// JSON schema the retrieval reply must satisfy.
    fn response_schema(top_k: usize) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "results": {
                    "type": "array",
                    "maxItems": top_k,
                    "items": {
                        "type": "object",
                        "properties": {
                            "file_id": { "type": "string" },
                            "filename": { "type": ["string", "null"] },
                            "score": { "type": "number", "minimum": 0, "maximum": 1 },
                            "text": { "type": "string" }
                        },
                        "required": ["file_id", "score", "text"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["results"],
            "additionalProperties": false
        })
    }

    fn search_instruction(query: &str, top_k: usize) -> String {
        format!(
            "문서 저장소에서 다음 질문과 관련된 내용을 검색해 주세요. 가장 관련성이 \
             높은 결과를 최대 {top_k}개까지, 각 결과의 file_id와 0과 1 사이의 \
             관련도 점수(score), 해당 본문(text)을 JSON으로 반환하세요. \
             질문: {query}"
        )
    }

    /// Extract the structured results from the response body; `None` when no
    /// structured payload could be parsed.
    fn parse_structured(body: &serde_json::Value) -> Option<RagResults> {
        let text = Self::output_text(body)?;
        serde_json::from_str::<RagResults>(&text).ok()
    }

    /// Concatenated `output_text` parts of the first message output item.
    fn output_text(body: &serde_json::Value) -> Option<String> {
        let output = body.get("output")?.as_array()?;
        let mut text = String::new();
        for item in output {
            if item.get("type").and_then(|t| t.as_str()) != Some("message") {
                continue;
            }
            for part in item.get("content")?.as_array()? {
                if part.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
            }
        }
        if text.is_empty() { None } else { Some(text) }
    }

    /// Fallback path: mine `file_citation` annotations from the message
    /// output, deduplicated by `(file_id, quote)`.
    fn mine_citations(body: &serde_json::Value, options: &SearchOptions) -> Vec<Snippet> {
        let mut seen = std::collections::HashSet::new();
        let mut snippets = Vec::new();

        let Some(output) = body.get("output").and_then(|o| o.as_array()) else {
            return snippets;
        };
        for item in output {
            let parts = item
                .get("content")
                .and_then(|c| c.as_array())
                .map(|a| a.as_slice())
                .unwrap_or(&[]);
            for part in parts {
                let annotations = part
                    .get("annotations")
                    .and_then(|a| a.as_array())
                    .map(|a| a.as_slice())
                    .unwrap_or(&[]);
                for annotation in annotations {
                    if annotation.get("type").and_then(|t| t.as_str()) != Some("file_citation") {
                        continue;
                    }
                    let file_id = annotation
                        .get("file_id")
                        .and_then(|f| f.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let quote = annotation
                        .get("quote")
                        .and_then(|q| q.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if !seen.insert((file_id.clone(), quote.clone())) {
                        continue;
                    }
                    let filename = annotation
                        .get("filename")
                        .and_then(|f| f.as_str())
                        .map(String::from);
                    snippets.push(Snippet {
                        content: truncate_content(&quote, options.max_chars),
                        score: 0.0,
                        metadata: SnippetMetadata {
                            source: SNIPPET_SOURCE.to_string(),
                            file_id,
                            filename,
                        },
                    });
                    if snippets.len() >= options.top_k {
                        return snippets;
                    }
                }
            }
        }
        snippets
    }
}

#[async_trait]
impl Retriever for VectorStoreClient {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        let request_body = json!({
            "model": RETRIEVAL_MODEL,
            "input": Self::search_instruction(query, options.top_k),
            "tools": [{
                "type": "file_search",
                "vector_store_ids": [self.vector_store_id],
                "max_num_results": options.top_k,
            }],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "rag_results",
                    "strict": true,
                    "schema": Self::response_schema(options.top_k),
                }
            }
        });

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| RetrievalError::Http(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RetrievalError::Malformed(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(RetrievalError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut snippets = match Self::parse_structured(&body) {
            Some(parsed) if !parsed.results.is_empty() => parsed
                .results
                .into_iter()
                .take(options.top_k)
                .map(|r| Snippet {
                    content: truncate_content(&r.text, options.max_chars),
                    score: r.score.unwrap_or(0.0),
                    metadata: SnippetMetadata {
                        source: SNIPPET_SOURCE.to_string(),
                        file_id: r.file_id,
                        filename: r.filename,
                    },
                })
                .collect::<Vec<_>>(),
            _ => Self::mine_citations(&body, options),
        };

        snippets.retain(|s| s.score >= options.threshold);
        snippets.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(
            query = %query,
            hits = snippets.len(),
            "retrieval completed"
        );
        Ok(snippets)
    }
}
