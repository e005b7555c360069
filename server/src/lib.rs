//! # streamsockets-server
//!
//! Accepts authenticated WebSocket connections and bridges their binary
//! frames to UDP sockets opened toward the configured backend route. The
//! counterpart client process is `streamsockets-client`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap, runtime setup, reload task, shutdown
//! config.rs     — environment-driven options
//! accounts.rs   — YAML account records, validation, CIDR pre-parse
//! auth.rs       — token authentication, generation swap on reload, leases
//! gate.rs       — upgrade-time admission (400/401/403), lease lifecycle
//! session.rs    — per-connection tunnel handler (NEW/CLOSE, demux, reaper)
//! registry.rs   — per-connection tunnel id/activity bookkeeping
//! downstream.rs — per-tunnel UDP→WS pump, socket tuning
//! metrics.rs    — per-account counters + Prometheus text exposition
//! ```
//!
//! The library surface exists so the integration test suite can run the
//! server in-process on an ephemeral port.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod downstream;
pub mod gate;
pub mod metrics;
pub mod registry;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use auth::TokenAuthenticator;
use config::ServerConfig;
use metrics::Metrics;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub auth: Arc<TokenAuthenticator>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        auth: Arc<TokenAuthenticator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            auth,
            metrics,
        }
    }
}

/// Build the tunnel router: the WebSocket upgrade path plus request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.ws_path, get(gate::tunnel_upgrade))
        .layer(DefaultBodyLimit::max(state.config.http_max_content_length))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the tunnel router on an already-bound listener until the socket
/// closes. Used by tests; `main` adds graceful shutdown on top.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
