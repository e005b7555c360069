//! Per-connection tunnel handler, running inside the WebSocket upgrade.
//!
//! Each connection gets one task that owns all of its state: the tunnel
//! registry, the legacy single-tunnel slot, the pending-frame queue, and the
//! idle reaper. Downstream pumps send outgoing frames through an mpsc channel
//! that a dedicated send task drains into the WebSocket sink, so the handler
//! never contends with them.
//!
//! Multi-tunnel protocol: the first tunnel opens as soon as the handshake
//! completes (the admission gate already validated the connection); `NEW`
//! text frames open additional tunnels up to the per-connection cap; binary
//! frames are demultiplexed by their leading tunnel-id byte. A periodic check
//! reaps tunnels idle past the timeout; the first tunnel is never reaped.
//!
//! Legacy protocol: the first JSON text frame names the route; a later JSON
//! frame replaces it after closing the current UDP socket. Binary frames that
//! arrive before the route is connected are queued (bounded) and flushed once
//! it is.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use streamsockets_common::protocol::{
    decode_data_frame, ConnectRequest, ConnectResponse, ControlMessage, RESERVED_TUNNEL_ID,
};

use crate::accounts::Account;
use crate::downstream;
use crate::registry::TunnelRegistry;
use crate::AppState;

/// Cap on binary frames queued before the legacy route is connected.
const PENDING_FRAME_LIMIT: usize = 1024;

/// Depth of the outbound frame channel; overflow drops datagrams (see
/// [`crate::downstream`]).
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Connection attributes attached by the admission gate.
pub struct ConnectionMeta {
    pub account: Arc<Account>,
    pub client_ip: IpAddr,
    pub route: String,
    pub new_protocol: bool,
}

/// The legacy protocol's single tunnel.
struct LegacyTunnel {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl LegacyTunnel {
    fn close(self) {
        self.task.abort();
    }
}

struct Connection {
    state: AppState,
    meta: ConnectionMeta,
    registry: TunnelRegistry,
    out_tx: mpsc::Sender<Message>,
    legacy: Option<LegacyTunnel>,
    pending: VecDeque<Bytes>,
}

/// Drive one authenticated WebSocket connection until it closes.
pub async fn handle_connection(socket: WebSocket, state: AppState, meta: ConnectionMeta) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let max_tunnels = state.config.max_udp_tunnels_per_client;
    let reap_period = state.config.udp_tunnel_timeout;
    let mut conn = Connection {
        state,
        meta,
        registry: TunnelRegistry::new(max_tunnels),
        out_tx,
        legacy: None,
        pending: VecDeque::new(),
    };

    let admitted = if conn.meta.new_protocol {
        conn.open_first_tunnel().await
    } else {
        true
    };

    if admitted {
        // Reaping only ever applies while a second tunnel exists; the first
        // tunnel is exempt for the life of the connection.
        let mut reaper = tokio::time::interval_at(
            tokio::time::Instant::now() + reap_period,
            reap_period,
        );
        loop {
            tokio::select! {
                msg = ws_stream.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    if !conn.handle_message(msg).await {
                        break;
                    }
                }
                _ = reaper.tick() => {
                    conn.reap_idle().await;
                }
            }
        }
    }

    conn.shutdown();
    drop(conn);
    // Let queued frames (including any failure reply) flush before the sink
    // is torn down.
    let _ = tokio::time::timeout(Duration::from_secs(5), send_task).await;
}

async fn resolve_route(route: &str) -> Option<SocketAddr> {
    match tokio::net::lookup_host(route).await {
        Ok(mut addrs) => addrs.next(),
        Err(err) => {
            debug!(route, error = %err, "route resolution failed");
            None
        }
    }
}

impl Connection {
    /// Open the first tunnel right after the multi-tunnel handshake. A
    /// failure here is terminal for the connection.
    async fn open_first_tunnel(&mut self) -> bool {
        if !self.state.auth.contains_route(&self.meta.route) {
            warn!(
                account = %self.meta.account.name,
                client_ip = %self.meta.client_ip,
                route = %self.meta.route,
                "attempted to connect to unauthorized route"
            );
            return false;
        }
        self.create_tunnel().await.is_some()
    }

    /// Open a UDP socket to the configured route, register it, start its
    /// downstream pump, and grant the id to the client.
    async fn create_tunnel(&mut self) -> Option<u8> {
        let Some(remote) = resolve_route(&self.meta.route).await else {
            warn!(
                account = %self.meta.account.name,
                route = %self.meta.route,
                "invalid route parameters"
            );
            return None;
        };

        let socket = match downstream::open_udp_socket(remote).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(
                    account = %self.meta.account.name,
                    route = %self.meta.route,
                    error = %err,
                    "failed to open UDP tunnel"
                );
                return None;
            }
        };

        let id = self.registry.create(Arc::clone(&socket), remote)?;
        let task = downstream::spawn(
            id,
            socket,
            self.out_tx.clone(),
            Arc::clone(&self.state.metrics),
            self.meta.account.name.clone(),
            true,
        );
        self.registry.attach_task(id, task);

        info!(
            account = %self.meta.account.name,
            client_ip = %self.meta.client_ip,
            tunnel_id = id,
            route = %self.meta.route,
            "UDP tunnel connected"
        );
        self.send_text(ControlMessage::SocketId(id).to_string()).await;
        Some(id)
    }

    /// Returns `false` when the connection should close.
    async fn handle_message(&mut self, msg: Message) -> bool {
        match msg {
            Message::Binary(frame) => {
                if self.meta.new_protocol {
                    self.handle_data_frame(&frame).await;
                } else {
                    self.handle_legacy_frame(frame).await;
                }
                true
            }
            Message::Text(text) => {
                if self.meta.new_protocol {
                    self.handle_control(text.as_str()).await;
                    true
                } else {
                    self.handle_legacy_connect(text.as_str()).await
                }
            }
            // The WebSocket layer answers pings with matching pongs on its own.
            Message::Ping(payload) => {
                trace!(len = payload.len(), "ping");
                true
            }
            Message::Pong(_) => true,
            Message::Close(_) => false,
        }
    }

    /// Multi-tunnel binary frame: leading byte selects the tunnel.
    async fn handle_data_frame(&mut self, frame: &[u8]) {
        let Some((id, payload)) = decode_data_frame(frame) else {
            warn!("received binary frame with no tunnel id");
            return;
        };
        if id == RESERVED_TUNNEL_ID {
            warn!("received data for reserved tunnel id 0");
            return;
        }
        if !self.registry.touch(id) {
            warn!(tunnel_id = id, "received data for unknown tunnel id");
            return;
        }
        let Some(tunnel) = self.registry.get(id) else {
            return;
        };
        if let Err(err) = tunnel.socket.send(payload).await {
            debug!(tunnel_id = id, error = %err, "UDP send failed, dropping datagram");
            return;
        }
        self.state
            .metrics
            .record_bytes_received(&self.meta.account.name, payload.len() as u64);
    }

    /// Multi-tunnel text frame: only `NEW` is meaningful from the client.
    async fn handle_control(&mut self, text: &str) {
        match ControlMessage::parse(text) {
            Some(ControlMessage::New) => {
                if self.registry.len() >= self.state.config.max_udp_tunnels_per_client {
                    warn!(
                        account = %self.meta.account.name,
                        client_ip = %self.meta.client_ip,
                        limit = self.state.config.max_udp_tunnels_per_client,
                        "max UDP tunnels limit reached"
                    );
                    return;
                }
                self.create_tunnel().await;
            }
            _ => {
                warn!(
                    account = %self.meta.account.name,
                    client_ip = %self.meta.client_ip,
                    text,
                    "received unexpected text frame"
                );
            }
        }
    }

    /// Legacy JSON connection request: validates the route, replaces any
    /// current tunnel, and replies with the JSON status. Returns `false`
    /// when the connection must close (after the failure reply is queued).
    async fn handle_legacy_connect(&mut self, text: &str) -> bool {
        let request: ConnectRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "malformed legacy connection request");
                self.send_legacy_response(ConnectResponse::failure("Invalid address or port"))
                    .await;
                return false;
            }
        };
        let route = format!("{}:{}", request.address, request.port);

        if !self.state.auth.contains_route(&route) {
            self.send_legacy_response(ConnectResponse::failure("Route is not allowed"))
                .await;
            return false;
        }

        // A repeat request switches the route: the current socket closes first.
        if let Some(current) = self.legacy.take() {
            current.close();
        }

        let Some(remote) = resolve_route(&route).await else {
            self.send_legacy_response(ConnectResponse::failure("Invalid address or port"))
                .await;
            return false;
        };
        let socket = match downstream::open_udp_socket(remote).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(
                    account = %self.meta.account.name,
                    route,
                    error = %err,
                    "failed to connect to remote server"
                );
                self.send_legacy_response(ConnectResponse::failure(err.to_string()))
                    .await;
                return false;
            }
        };

        let task = downstream::spawn(
            RESERVED_TUNNEL_ID,
            Arc::clone(&socket),
            self.out_tx.clone(),
            Arc::clone(&self.state.metrics),
            self.meta.account.name.clone(),
            false,
        );

        // Flush frames that arrived while no route was connected.
        while let Some(frame) = self.pending.pop_front() {
            if socket.send(&frame).await.is_ok() {
                self.state
                    .metrics
                    .record_bytes_received(&self.meta.account.name, frame.len() as u64);
            }
        }

        self.legacy = Some(LegacyTunnel { socket, task });
        info!(
            account = %self.meta.account.name,
            client_ip = %self.meta.client_ip,
            route,
            "connected to remote server (old protocol)"
        );
        self.send_legacy_response(ConnectResponse::connected()).await;
        true
    }

    /// Legacy binary frame: forward to the single tunnel, or queue while the
    /// route handshake is still outstanding.
    async fn handle_legacy_frame(&mut self, frame: Bytes) {
        match &self.legacy {
            Some(tunnel) => {
                if tunnel.socket.send(&frame).await.is_ok() {
                    self.state
                        .metrics
                        .record_bytes_received(&self.meta.account.name, frame.len() as u64);
                }
            }
            None => {
                if self.pending.len() >= PENDING_FRAME_LIMIT {
                    warn!("pending frame queue full, dropping oldest frame");
                    self.pending.pop_front();
                }
                self.pending.push_back(frame);
            }
        }
    }

    async fn reap_idle(&mut self) {
        if self.registry.len() <= 1 {
            return;
        }
        let timeout = self.state.config.udp_tunnel_timeout;
        for id in self.registry.reap_idle(timeout) {
            info!(
                account = %self.meta.account.name,
                client_ip = %self.meta.client_ip,
                tunnel_id = id,
                timeout_secs = timeout.as_secs(),
                "UDP tunnel timed out"
            );
            self.send_text(ControlMessage::CloseId(id).to_string()).await;
        }
    }

    async fn send_text(&self, text: String) {
        let _ = self.out_tx.send(Message::Text(text.into())).await;
    }

    async fn send_legacy_response(&self, response: ConnectResponse) {
        match serde_json::to_string(&response) {
            Ok(text) => self.send_text(text).await,
            Err(err) => warn!(error = %err, "failed to encode legacy response"),
        }
    }

    fn shutdown(&mut self) {
        self.registry.close_all();
        if let Some(tunnel) = self.legacy.take() {
            tunnel.close();
        }
        self.pending.clear();
    }
}
