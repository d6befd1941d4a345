//! Server configuration.
//!
//! Configuration is environment-driven: `.env` values are loaded by the
//! binary entry point (via `dotenvy`) before `ServerConfig::from_env()` runs,
//! so plain environment variables always win over `.env` entries.
//!
//! `OPENAI_API_KEY` is the only required variable; the process refuses to
//! start without it. Everything else has a default suitable for local
//! development.

use std::env;

use thiserror::Error;

/// Default bind host.
const DEFAULT_HOST: &str = "0.0.0.0";

/// Default bind port.
const DEFAULT_PORT: u16 = 3000;

/// Default per-IP WebSocket connection cap.
const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 16;

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `OPENAI_API_KEY` is absent or empty
    #[error("OPENAI_API_KEY is required but not set")]
    MissingApiKey,

    /// A numeric variable failed to parse
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Server configuration.
///
/// Contains everything needed to run the gateway: bind address, the upstream
/// realtime endpoint, the retrieval endpoint, CORS origin and connection
/// limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,

    /// OpenAI API key, used for both the realtime socket and retrieval
    pub openai_api_key: String,

    /// Upstream realtime WebSocket endpoint (without the `?model=` query).
    /// Overridable so integration tests can point at a local mock.
    pub realtime_url: String,

    /// Base URL of the OpenAI REST API, used by the retrieval client.
    pub openai_base_url: String,

    /// Allowed CORS origin for the HTTP layer (`*` for any).
    /// The production deployment fronts this process with an HTTP wrapper
    /// that owns the real CORS policy; this is the development fallback.
    pub client_origin: Option<String>,

    /// Global WebSocket connection cap (None = unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Per-IP WebSocket connection cap
    pub max_connections_per_ip: usize,
}

impl ServerConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let openai_api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let host = env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = parse_var("PORT", DEFAULT_PORT)?;

        let realtime_url = env::var("REALTIME_URL")
            .unwrap_or_else(|_| crate::core::realtime::UPSTREAM_REALTIME_URL.to_string());
        let openai_base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let client_origin = env::var("CLIENT_ORIGIN").ok().filter(|o| !o.is_empty());

        let max_websocket_connections = match env::var("MAX_WEBSOCKET_CONNECTIONS") {
            Ok(v) => Some(v.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                name: "MAX_WEBSOCKET_CONNECTIONS",
                value: v,
            })?),
            Err(_) => None,
        };
        let max_connections_per_ip =
            parse_var("MAX_CONNECTIONS_PER_IP", DEFAULT_MAX_CONNECTIONS_PER_IP)?;

        Ok(Self {
            host,
            port,
            openai_api_key,
            realtime_url,
            openai_base_url,
            client_origin,
            max_websocket_connections,
            max_connections_per_ip,
        })
    }

    /// Socket address string the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse an optional environment variable with a typed default.
fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value: v }),
        Err(_) => Ok(default),
    }
}
