pub mod audio;
pub mod rag;
pub mod realtime;
pub mod tools;

// Re-export commonly used types for convenience
pub use audio::{AUDIO_CHUNK_SIZE, AudioError, chunk, looks_like_pcm16, to_base64_chunks};
pub use rag::{RagCache, RetrievalError, Retriever, SearchOptions, Snippet, VectorStoreClient};
pub use realtime::{
    EventPayload, SessionError, SessionEvent, SessionState, UpstreamConfig, UpstreamSession,
};
pub use tools::{ToolExecutor, ToolOutput};
