//! WebSocket server
//!
//! Accepts streaming sessions, authenticates the handshake from transport
//! headers, and hands each accepted socket to a [`session::handle_session`].

pub mod auth;
pub mod dispatch;
pub mod emitter;
pub mod iot;
pub mod session;
pub mod vad_gate;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::music::MusicLibrary;
use crate::providers::{self, FileLockManager, ProviderSet};
use crate::tools::ToolRegistry;
use auth::AuthPolicy;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderSet>,
    pub music: Arc<MusicLibrary>,
    pub tools: Arc<ToolRegistry>,
    pub auth: Arc<AuthPolicy>,
}

/// Build providers and serve until the task is cancelled.
pub async fn start(config: Config) -> Result<()> {
    let locks = FileLockManager::new();
    let providers = Arc::new(providers::build(&config, locks).await?);
    let music = Arc::new(MusicLibrary::new(&config.music));
    let tools = Arc::new(ToolRegistry::with_builtins());
    let auth = Arc::new(AuthPolicy::new(&config.server.auth));
    let config = Arc::new(config);

    let addr: SocketAddr = format!("{}:{}", config.server.ip, config.server.port)
        .parse()
        .context("invalid server address")?;

    let state = ServerState { config, providers, music, tools, auth };

    let app = Router::new()
        .route("/xiaozhi/v1/", get(ws_handler))
        .route("/xiaozhi/v1", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Server is running at ws://{}/xiaozhi/v1/", addr);
    let listener =
        tokio::net::TcpListener::bind(addr).await.context("failed to bind server address")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Authenticate from the transport headers, then upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Response {
    let device_id = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());

    if let Err(e) = state.auth.authenticate(device_id.as_deref(), authorization) {
        warn!("handshake rejected (device: {:?}): {}", device_id, e);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| {
        session::handle_session(
            socket,
            state.config,
            state.providers,
            state.music,
            state.tools,
            device_id,
        )
    })
}
