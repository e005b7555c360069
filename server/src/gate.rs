//! Admission gate for the WebSocket upgrade.
//!
//! Runs as the upgrade-path handler, before the protocol switch: it checks
//! the authentication headers, resolves the client IP, authenticates the
//! token against the account store, and takes a lease. Only then does the
//! upgrade complete and the tunnel handler start. Upgrade-time responses:
//!
//! - `101` — admitted, connection proceeds to [`crate::session`]
//! - `400` — missing or wrong `X-Auth-Type`
//! - `401` — unknown token, disallowed route, or disallowed client IP
//! - `403` — account already leased with `reuse: false`
//!
//! The lease is released (and the connection duration recorded) when the
//! tunnel handler returns.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use crate::session::{self, ConnectionMeta};
use crate::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Handler for `GET <WS_PATH>`.
pub async fn tunnel_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth_type_ok = header_str(&headers, "x-auth-type")
        .is_some_and(|value| value.eq_ignore_ascii_case("token"));
    if !auth_type_ok {
        return (StatusCode::BAD_REQUEST, "Invalid authentication type").into_response();
    }

    let token = header_str(&headers, "x-auth-token").unwrap_or_default();

    // Behind a proxy the peer address is the proxy's; deployments set
    // CLIENT_IP_HEADER to recover the real client address.
    let client_ip: IpAddr = match &state.config.client_ip_header {
        Some(name) => match header_str(&headers, name).and_then(|value| value.parse().ok()) {
            Some(ip) => ip,
            None => {
                debug!(header = %name, "client IP header missing or unparsable");
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }
        },
        None => peer.ip(),
    };

    // Both route headers present means the multi-tunnel protocol; otherwise
    // fall back to the legacy combined header.
    let (new_protocol, route) = match (
        header_str(&headers, "x-route-address"),
        header_str(&headers, "x-route-port"),
    ) {
        (Some(address), Some(port)) => (true, format!("{address}:{port}")),
        _ => (
            false,
            header_str(&headers, "x-auth-route")
                .unwrap_or_default()
                .to_string(),
        ),
    };

    let Some(account) = state.auth.authenticate(token, &route, client_ip) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    if !state.auth.lease(&account) {
        return (StatusCode::FORBIDDEN, "Failed to lease account").into_response();
    }

    info!(
        account = %account.name,
        %client_ip,
        route,
        new_protocol,
        "WebSocket connection admitted"
    );
    state.metrics.record_connection_start(&account.name);

    let meta = ConnectionMeta {
        account: Arc::clone(&account),
        client_ip,
        route,
        new_protocol,
    };
    let max_frame_size = state.config.max_frame_size;

    ws.max_frame_size(max_frame_size)
        .max_message_size(max_frame_size)
        .on_upgrade(move |socket| async move {
            let started = Instant::now();
            session::handle_connection(socket, state.clone(), meta).await;
            if state.auth.release(&account) {
                info!(account = %account.name, "disconnected from the server");
            }
            state
                .metrics
                .record_connection_end(&account.name, started.elapsed());
        })
}
