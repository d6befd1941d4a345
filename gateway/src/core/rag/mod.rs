//! Retrieval-augmented generation support.
//!
//! The upstream model asks for documents through the `rag_search` tool; this
//! module answers those requests from the OpenAI vector store and renders the
//! hits into a context block the model can ground its reply on.

pub mod cache;
pub mod client;

pub use cache::{RAG_CACHE_TTL, RagCache, RagCacheEntry, normalize_query};
pub use client::{
    RetrievalError, Retriever, SearchOptions, Snippet, SnippetMetadata, VECTOR_STORE_ID,
    VectorStoreClient, format_context, format_structured,
};
