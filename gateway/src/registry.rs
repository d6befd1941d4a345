//! Process-wide session registry.
//!
//! Maps session ids to their live upstream sessions. The registry is the only
//! piece of state shared across client connections, so it must never hold a
//! shard lock across slow work: callers clone the `Arc` out and operate on it
//! outside the map.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use thiserror::Error;

use crate::core::realtime::UpstreamSession;

/// Registry operation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Insert with an id that is already registered
    #[error("session already exists: {0}")]
    AlreadyExists(String),
}

/// Per-session registry entry: the upstream session plus broker metadata.
pub struct SessionEntry {
    /// The owning session's upstream socket handle
    pub session: Arc<UpstreamSession>,
    /// When the client connected
    pub created_at: SystemTime,
    /// Set during teardown so in-flight audio frames are dropped instead of
    /// racing the closing upstream socket
    paused: AtomicBool,
}

impl SessionEntry {
    pub fn new(session: Arc<UpstreamSession>) -> Self {
        Self {
            session,
            created_at: SystemTime::now(),
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
}

/// Concurrent session-id → session map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails if the id is already taken.
    pub fn insert(&self, session_id: &str, entry: SessionEntry) -> Result<(), RegistryError> {
        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyExists(session_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(entry));
                Ok(())
            }
        }
    }

    /// Look up a session by id.
    pub fn lookup(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Remove a session. Idempotent.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(session_id).map(|(_, e)| e)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Visit every live session. Callers must keep `f` brief; long work runs
    /// on the cloned `Arc` outside the iteration.
    pub fn for_each<F: FnMut(&str, &Arc<SessionEntry>)>(&self, mut f: F) {
        for entry in self.sessions.iter() {
            f(entry.key(), entry.value());
        }
    }
}
