//! Per-session retrieval cache.
//!
//! Repeated questions inside one conversation are common ("다시 말해줘",
//! rephrasings the model normalizes to the same query), so confident
//! retrieval results are kept for a short window keyed by the normalized
//! query. Entries never cross sessions; the cache dies with its session.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// How long a cached retrieval result stays valid.
pub const RAG_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// One cached retrieval result.
#[derive(Debug, Clone)]
pub struct RagCacheEntry {
    /// Rendered context block
    pub context: String,
    /// Source file ids backing the context
    pub sources: Vec<String>,
    inserted_at: Instant,
}

/// Collapse whitespace and lowercase a query for cache keying.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// TTL map from normalized query to rendered retrieval result.
#[derive(Debug, Default)]
pub struct RagCache {
    entries: HashMap<String, RagCacheEntry>,
}

impl RagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch an unexpired entry. Expired entries are evicted on access.
    pub fn get(&mut self, query: &str) -> Option<&RagCacheEntry> {
        let key = normalize_query(query);
        if let Some(entry) = self.entries.get(&key) {
            if entry.inserted_at.elapsed() >= RAG_CACHE_TTL {
                self.entries.remove(&key);
                return None;
            }
        }
        self.entries.get(&key)
    }

    /// Store a retrieval result under the normalized query.
    pub fn insert(&mut self, query: &str, context: String, sources: Vec<String>) {
        self.entries.insert(
            normalize_query(query),
            RagCacheEntry {
                context,
                sources,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
