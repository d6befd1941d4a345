//! Tool executor for model-initiated `rag_search` calls.
//!
//! The upstream streams tool arguments as partial JSON; the session's read
//! task coalesces them per call id and hands the finished argument string to
//! [`ToolExecutor::dispatch`], which rate-limits, normalizes parameters, runs
//! retrieval and shapes the `tool.output` payload. Dispatch never fails the
//! session: every failure mode becomes a structured output the model can
//! react to.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::rag::{RagCache, Retriever, SearchOptions, format_structured};

/// Minimum spacing between tool dispatches in one session.
pub const TOOL_MIN_SPACING: Duration = Duration::from_millis(1200);

/// Consecutive low-confidence results after which the output advises
/// escalating to a human counselor.
pub const LOW_CONFIDENCE_ESCALATION_THRESHOLD: u32 = 3;

/// Snippet character budget for provisional searches.
const PROVISIONAL_MAX_CHARS: usize = 120;

/// Snippet character budget for final searches.
const FINAL_MAX_CHARS: usize = 200;

/// Asks the model to retry with a reworded query.
const LOW_CONFIDENCE_RETRY_MESSAGE: &str =
    "관련 문서를 찾지 못했습니다. 질문을 조금 더 구체적으로 바꾸어 다시 검색해 주세요.";

/// After repeated misses, advise handing off to a human counselor.
const LOW_CONFIDENCE_ESCALATION_MESSAGE: &str =
    "관련 문서를 계속 찾지 못하고 있습니다. 담당 상담원에게 문의하도록 안내해 주세요.";

// =============================================================================
// Output
// =============================================================================

/// Payload for an upstream `tool.output` frame.
#[derive(Debug, Clone)]
pub struct ToolOutput(Value);

impl ToolOutput {
    /// Serialize for the `output` field of the wire frame.
    pub fn into_json(self) -> String {
        self.0.to_string()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Search mode requested by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchMode {
    /// Quick look-ahead while the model is still composing
    Provisional,
    /// Grounding search for the actual answer
    Final,
}

impl SearchMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Provisional => "provisional",
            Self::Final => "final",
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Per-session mutable tool state.
struct ToolState {
    last_tool_at: Option<Instant>,
    low_confidence_count: u32,
    cache: RagCache,
}

/// Per-session tool executor.
pub struct ToolExecutor {
    retriever: Arc<dyn Retriever>,
    state: Mutex<ToolState>,
}

impl ToolExecutor {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            retriever,
            state: Mutex::new(ToolState {
                last_tool_at: None,
                low_confidence_count: 0,
                cache: RagCache::new(),
            }),
        }
    }

    /// Execute one completed tool call and shape its output payload.
    pub async fn dispatch(&self, call_id: &str, name: &str, raw_arguments: &str) -> ToolOutput {
        // Malformed or empty accumulated arguments degrade to an empty object
        let arguments: Value = if raw_arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(raw_arguments).unwrap_or_else(|e| {
                tracing::warn!(call_id = %call_id, "malformed tool arguments ({e}), using empty object");
                json!({})
            })
        };

        let mut state = self.state.lock().await;

        let now = Instant::now();
        if let Some(last) = state.last_tool_at {
            if now.duration_since(last) < TOOL_MIN_SPACING {
                tracing::debug!(call_id = %call_id, "tool call rate-limited");
                return ToolOutput(json!({ "skipped": true, "reason": "rate_limited" }));
            }
        }
        state.last_tool_at = Some(now);

        if name != "rag_search" {
            return ToolOutput(json!({ "error": "unknown tool" }));
        }

        let query = arguments
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if query.is_empty() {
            return ToolOutput(json!({ "error": "empty query" }));
        }

        let mode = match arguments.get("mode").and_then(|m| m.as_str()) {
            Some("provisional") => SearchMode::Provisional,
            _ => SearchMode::Final,
        };
        let top_k = arguments
            .get("topK")
            .and_then(|k| k.as_u64())
            .unwrap_or(2)
            .clamp(1, 5) as usize;
        let threshold = arguments
            .get("threshold")
            .and_then(|t| t.as_f64())
            .unwrap_or(0.3)
            .clamp(0.0, 1.0);

        // Provisional searches trade recall for speed: one snippet, a higher
        // confidence bar, a tighter character budget
        let options = match mode {
            SearchMode::Provisional => SearchOptions {
                top_k: top_k.min(1),
                threshold: threshold.max(0.4),
                max_chars: PROVISIONAL_MAX_CHARS,
            },
            SearchMode::Final => SearchOptions {
                top_k,
                threshold,
                max_chars: FINAL_MAX_CHARS,
            },
        };

        let cached = state
            .cache
            .get(&query)
            .map(|e| (e.context.clone(), e.sources.clone()));
        if let Some((context, sources)) = cached {
            tracing::debug!(call_id = %call_id, "retrieval cache hit");
            state.low_confidence_count = 0;
            let count = sources.len();
            return ToolOutput(json!({
                "context": context,
                "sources": sources,
                "count": count,
                "mode": mode.as_str(),
            }));
        }

        let snippets = match self.retriever.search(&query, &options).await {
            Ok(snippets) => snippets,
            Err(e) => {
                tracing::warn!(call_id = %call_id, "retrieval failed: {e}");
                return ToolOutput(json!({ "error": e.to_string() }));
            }
        };

        let low_confidence =
            snippets.is_empty() || snippets[0].score < options.threshold;
        if low_confidence {
            state.low_confidence_count += 1;
            let count = state.low_confidence_count;
            let message = if count >= LOW_CONFIDENCE_ESCALATION_THRESHOLD {
                LOW_CONFIDENCE_ESCALATION_MESSAGE
            } else {
                LOW_CONFIDENCE_RETRY_MESSAGE
            };
            return ToolOutput(json!({
                "context": message,
                "sources": [],
                "count": 0,
                "mode": mode.as_str(),
                "lowConfidence": true,
                "lowConfidenceCount": count,
            }));
        }

        state.low_confidence_count = 0;
        let (sources, _contents, context) = format_structured(&snippets);
        state.cache.insert(&query, context.clone(), sources.clone());

        ToolOutput(json!({
            "context": context,
            "sources": sources,
            "count": snippets.len(),
            "mode": mode.as_str(),
        }))
    }

    /// Current consecutive low-confidence count.
    pub async fn low_confidence_count(&self) -> u32 {
        self.state.lock().await.low_confidence_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rag::{RetrievalError, Snippet, SnippetMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted retriever: returns a settable result and records call options.
    struct ScriptedRetriever {
        snippets: StdMutex<Vec<Snippet>>,
        calls: AtomicUsize,
        seen_options: StdMutex<Vec<SearchOptions>>,
        fail: bool,
    }

    impl ScriptedRetriever {
        fn returning(snippets: Vec<Snippet>) -> Arc<Self> {
            Arc::new(Self {
                snippets: StdMutex::new(snippets),
                calls: AtomicUsize::new(0),
                seen_options: StdMutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                snippets: StdMutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                seen_options: StdMutex::new(Vec::new()),
                fail: true,
            })
        }

        fn set_snippets(&self, snippets: Vec<Snippet>) {
            *self.snippets.lock().unwrap() = snippets;
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Retriever for ScriptedRetriever {
        async fn search(
            &self,
            _query: &str,
            options: &SearchOptions,
        ) -> Result<Vec<Snippet>, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_options.lock().unwrap().push(*options);
            if self.fail {
                return Err(RetrievalError::Http("connection refused".to_string()));
            }
            Ok(self.snippets.lock().unwrap().clone())
        }
    }

    fn snippet(file_id: &str, score: f64) -> Snippet {
        Snippet {
            content: "기초연금 수급 안내".to_string(),
            score,
            metadata: SnippetMetadata {
                source: "OpenAI Vector Store".to_string(),
                file_id: file_id.to_string(),
                filename: None,
            },
        }
    }

    fn args(query: &str) -> String {
        json!({ "query": query, "mode": "final" }).to_string()
    }

    #[tokio::test]
    async fn test_confident_result() {
        let retriever = ScriptedRetriever::returning(vec![snippet("f1", 0.82)]);
        let executor = ToolExecutor::new(retriever.clone());

        let output = executor.dispatch("c1", "rag_search", &args("노인 복지")).await;
        let value = output.as_value();
        assert_eq!(value["count"], 1);
        assert_eq!(value["mode"], "final");
        assert_eq!(value["sources"][0], "f1");
        assert!(value["context"].as_str().unwrap().starts_with("[출처: f1]"));
        assert!(value.get("lowConfidence").is_none());
        assert_eq!(executor.low_confidence_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let executor = ToolExecutor::new(ScriptedRetriever::returning(vec![]));
        let output = executor.dispatch("c1", "web_search", "{}").await;
        assert_eq!(output.as_value()["error"], "unknown tool");
    }

    #[tokio::test]
    async fn test_empty_query() {
        let executor = ToolExecutor::new(ScriptedRetriever::returning(vec![]));
        let output = executor
            .dispatch("c1", "rag_search", r#"{"query":"   "}"#)
            .await;
        assert_eq!(output.as_value()["error"], "empty query");
    }

    #[tokio::test]
    async fn test_malformed_arguments_become_empty_object() {
        let executor = ToolExecutor::new(ScriptedRetriever::returning(vec![]));
        let output = executor.dispatch("c1", "rag_search", "{\"query\": ").await;
        // Degraded to {} → no query
        assert_eq!(output.as_value()["error"], "empty query");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spacing() {
        let retriever = ScriptedRetriever::returning(vec![snippet("f1", 0.9)]);
        let executor = ToolExecutor::new(retriever.clone());

        let first = executor.dispatch("c1", "rag_search", &args("기초연금")).await;
        assert_eq!(first.as_value()["count"], 1);

        // 500 ms later: skipped without touching retrieval
        tokio::time::advance(Duration::from_millis(500)).await;
        let second = executor.dispatch("c2", "rag_search", &args("기초연금")).await;
        assert_eq!(second.as_value()["skipped"], true);
        assert_eq!(second.as_value()["reason"], "rate_limited");
        assert_eq!(retriever.call_count(), 1);

        // Past the spacing window the next call executes (cache hit, so the
        // retriever still is not called again)
        tokio::time::advance(Duration::from_millis(1300)).await;
        let third = executor.dispatch("c3", "rag_search", &args("기초연금")).await;
        assert_eq!(third.as_value()["count"], 1);
        assert_eq!(retriever.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_escalation() {
        let retriever = ScriptedRetriever::returning(vec![]);
        let executor = ToolExecutor::new(retriever);

        for expected in 1..=3u32 {
            if expected > 1 {
                tokio::time::advance(TOOL_MIN_SPACING).await;
            }
            let output = executor
                .dispatch("c1", "rag_search", &args("존재하지 않는 주제"))
                .await;
            let value = output.as_value();
            assert_eq!(value["lowConfidence"], true);
            assert_eq!(value["lowConfidenceCount"], expected);
            let context = value["context"].as_str().unwrap();
            if expected >= LOW_CONFIDENCE_ESCALATION_THRESHOLD {
                assert!(context.contains("관련 문서를 계속 찾지 못하고 있습니다"));
            } else {
                assert!(context.contains("다시 검색해 주세요"));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confident_result_resets_counter() {
        let retriever = ScriptedRetriever::returning(vec![]);
        let executor = ToolExecutor::new(retriever.clone());

        executor.dispatch("c1", "rag_search", &args("미지 주제")).await;
        tokio::time::advance(TOOL_MIN_SPACING).await;
        executor.dispatch("c2", "rag_search", &args("미지 주제 2")).await;
        assert_eq!(executor.low_confidence_count().await, 2);

        retriever.set_snippets(vec![snippet("f1", 0.9)]);
        tokio::time::advance(TOOL_MIN_SPACING).await;
        executor.dispatch("c3", "rag_search", &args("기초연금")).await;
        assert_eq!(executor.low_confidence_count().await, 0);
    }

    #[tokio::test]
    async fn test_provisional_clamps_parameters() {
        let retriever = ScriptedRetriever::returning(vec![snippet("f1", 0.9)]);
        let executor = ToolExecutor::new(retriever.clone());

        let raw = json!({
            "query": "노인 복지",
            "mode": "provisional",
            "topK": 4,
            "threshold": 0.1,
        })
        .to_string();
        executor.dispatch("c1", "rag_search", &raw).await;

        let seen = retriever.seen_options.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].top_k, 1);
        assert_eq!(seen[0].threshold, 0.4);
        assert_eq!(seen[0].max_chars, PROVISIONAL_MAX_CHARS);
    }

    #[tokio::test]
    async fn test_retrieval_failure_is_contained() {
        let executor = ToolExecutor::new(ScriptedRetriever::failing());
        let output = executor.dispatch("c1", "rag_search", &args("노인 복지")).await;
        let error = output.as_value()["error"].as_str().unwrap();
        assert!(error.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_retrieval() {
        let retriever = ScriptedRetriever::returning(vec![snippet("f1", 0.9)]);
        let executor = ToolExecutor::new(retriever.clone());

        executor.dispatch("c1", "rag_search", &args("노인 복지")).await;
        tokio::time::advance(TOOL_MIN_SPACING).await;
        // Whitespace variant of the same query hits the cache
        let output = executor
            .dispatch("c2", "rag_search", &args("노인   복지"))
            .await;
        assert_eq!(output.as_value()["count"], 1);
        assert_eq!(retriever.call_count(), 1);
    }
}
