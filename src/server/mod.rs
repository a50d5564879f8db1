//! HTTP and WebSocket front end
//!
//! Routes:
//! - `GET  /api/ws/download`: live progress channel, see [`crate::transport`]
//! - `GET  /api/download?downloadId=&file=`: stream a finished chunk file
//! - `/api/downloads/:id[/pause|/resume|/cancel|/files/:file/complete]`
//! - `/api/search-sessions[...]` and `POST /api/search`
//!
//! The caller identity is taken from the `x-user-id` header, which an
//! authenticating proxy in front of the service is trusted to set.

mod downloads;
mod search;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{OpenSearchClient, SearchBackend};
use crate::config::Config;
use crate::error::{ExportError, Result};
use crate::export::{ExportCoordinator, ExportSettings};
use crate::session::{ClientInfo, SessionRegistry};
use crate::transport::TransportAdapter;

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: ExportCoordinator,
    pub transport: TransportAdapter,
    pub registry: Arc<SessionRegistry>,
    pub backend: Arc<dyn SearchBackend>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn SearchBackend>) -> Self {
        let coordinator = ExportCoordinator::new(backend.clone(), ExportSettings::from_config(&config));
        let transport = TransportAdapter::new(coordinator.clone(), config.reconnect_grace());
        let registry = Arc::new(SessionRegistry::in_memory(config.search_poll_interval()));
        Self {
            coordinator,
            transport,
            registry,
            backend,
            config: Arc::new(config),
        }
    }
}

/// Caller identity from the request headers.
fn owner(headers: &HeaderMap) -> Result<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ExportError::Protocol(format!("missing {USER_HEADER} header")))
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientInfo {
        ip: header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header("x-real-ip")),
        user_agent: header("user-agent"),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws/download", get(downloads::websocket))
        .route("/api/download", get(downloads::download_file))
        .route("/api/downloads/:id", get(downloads::status).delete(downloads::remove))
        .route("/api/downloads/:id/pause", post(downloads::pause))
        .route("/api/downloads/:id/resume", post(downloads::resume))
        .route("/api/downloads/:id/cancel", post(downloads::cancel))
        .route(
            "/api/downloads/:id/files/:file/complete",
            post(downloads::complete_file),
        )
        .route("/api/search", post(search::search))
        .route("/api/search-sessions", post(search::create_session))
        .route("/api/search-sessions/cleanup", post(search::cleanup_sessions))
        .route("/api/search-sessions/stats", get(search::session_stats))
        .route("/api/search-sessions/:search_id", get(search::session_status))
        .route("/api/search-sessions/:search_id/cancel", post(search::cancel_session))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Periodically drop idle export sessions and stale search sessions.
async fn sweep(state: AppState, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(state.config.sweep_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let swept = state.coordinator.sweep_idle(state.config.session_idle()).await;
        match state
            .registry
            .cleanup_inactive(state.config.server.search_session_max_age)
            .await
        {
            Ok(removed) => debug!(swept, removed, "sweep finished"),
            Err(e) => warn!(error = %e, "search session cleanup failed"),
        }
    }
}

/// Run the service until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| ExportError::Generic(format!("invalid listen address: {e}")))?;
    let backend: Arc<dyn SearchBackend> = Arc::new(OpenSearchClient::new(&config.backend)?);
    let state = AppState::new(config, backend);

    tokio::fs::create_dir_all(&state.coordinator.settings().download_dir).await?;

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep(state.clone(), shutdown.clone()));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let coordinator = state.coordinator.clone();
    let stop = shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    coordinator.shutdown().await;
    Ok(())
}
