use std::net::SocketAddr;

use anyhow::anyhow;
use axum::middleware;
use http::{Method, header::CONTENT_TYPE};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sonju_gateway::{
    ServerConfig, middleware::connection_limit_middleware, routes, state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present, before the config reads the environment
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();
    let client_origin = config.client_origin.clone();

    let app_state = AppState::new(config);

    // The production deployment fronts this process with an HTTP wrapper that
    // owns CORS; this layer covers direct access during development
    let cors_layer = match client_origin.as_deref() {
        Some("*") => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET])
            .allow_headers([CONTENT_TYPE]),
        Some(origins) => {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET])
                .allow_headers([CONTENT_TYPE])
        }
        None => CorsLayer::new(),
    };

    let app = routes::create_gateway_router()
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            connection_limit_middleware,
        ))
        .with_state(app_state)
        .layer(cors_layer);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("invalid server address '{address}': {e}"))?;

    let listener = TcpListener::bind(&socket_addr).await?;
    info!("gateway listening on ws://{socket_addr}/");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install shutdown handler: {e}");
    }
    info!("shutdown signal received");
}
