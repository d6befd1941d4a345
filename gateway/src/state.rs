//! Shared application state.
//!
//! One `AppState` lives for the whole process and is cloned into every
//! request via `Arc`. It owns the configuration, the session registry, the
//! retrieval client shared by all tool executors, and the WebSocket
//! connection counters enforced by the connection-limit middleware.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ServerConfig;
use crate::core::rag::{Retriever, VectorStoreClient};
use crate::registry::SessionRegistry;

/// Reasons a connection slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    /// Global WebSocket connection cap reached
    GlobalLimitReached,
    /// Per-IP connection cap reached
    PerIpLimitReached,
}

/// Process-wide application state.
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Live sessions
    pub registry: SessionRegistry,
    /// Retrieval backend shared by all sessions' tool executors
    pub retriever: Arc<dyn Retriever>,

    /// Total open WebSocket connections
    ws_connections: AtomicUsize,
    /// Open connections per client IP
    ip_connections: Mutex<HashMap<IpAddr, usize>>,
}

impl AppState {
    /// Build the state from configuration.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let retriever: Arc<dyn Retriever> = Arc::new(VectorStoreClient::new(
            config.openai_api_key.clone(),
            config.openai_base_url.clone(),
        ));
        Self::with_retriever(config, retriever)
    }

    /// Build the state with an explicit retrieval backend (tests inject a
    /// mock here).
    pub fn with_retriever(config: ServerConfig, retriever: Arc<dyn Retriever>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            retriever,
            ws_connections: AtomicUsize::new(0),
            ip_connections: Mutex::new(HashMap::new()),
        })
    }

    /// Try to reserve a connection slot for `ip`.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let mut per_ip = self
            .ip_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(max) = self.config.max_websocket_connections {
            if self.ws_connections.load(Ordering::SeqCst) >= max {
                return Err(ConnectionLimitError::GlobalLimitReached);
            }
        }

        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        *count += 1;
        self.ws_connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Release a previously acquired connection slot.
    pub fn release_connection(&self, ip: IpAddr) {
        let mut per_ip = self
            .ip_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(count) = per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(&ip);
            }
            self.ws_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Current total WebSocket connection count.
    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    /// Current connection count for one IP.
    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(ip)
            .copied()
            .unwrap_or(0)
    }
}
