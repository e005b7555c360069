//! WebSocket carrier: one outbound connection attempt and its I/O loop.
//!
//! [`connect`] spawns a task that establishes the WebSocket (with the
//! authentication and route headers, TLS for `wss`), performs the protocol
//! handshake, and then drives a select loop over inbound frames, outbound
//! commands from the engine, the ping interval, and the liveness tick. Every
//! event it reports carries the connection epoch it was spawned with, so the
//! engine can discard events from attempts it has already abandoned.
//!
//! The carrier never reconnects by itself; it reports `Closed` exactly once
//! and lets the engine decide between backoff, exit, or staying idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use streamsockets_common::protocol::{
    ConnectRequest, ConnectResponse, ControlMessage, PING_PAYLOAD,
};

use crate::config::ClientConfig;
use crate::engine::EngineEvent;
use crate::liveness::LivenessMonitor;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Events reported to the engine. Each carries the epoch of the attempt that
/// produced it; the engine ignores mismatches.
#[derive(Debug)]
pub enum CarrierEvent {
    /// Handshake (and, on the legacy protocol, route negotiation) completed.
    Connected { epoch: u64 },
    /// Server granted a tunnel id (`SOCKET ID: <n>`).
    TunnelGranted { epoch: u64, tunnel_id: u8 },
    /// Server evicted a tunnel (`CLOSE ID: <n>`).
    TunnelClosed { epoch: u64, tunnel_id: u8 },
    /// Binary frame from the server.
    Data { epoch: u64, frame: Bytes },
    /// The connection ended — handshake failure, I/O error, liveness
    /// timeout, or server close.
    Closed { epoch: u64 },
}

/// Commands the engine sends down the carrier.
#[derive(Debug)]
pub enum CarrierCommand {
    /// Binary frame to forward as-is.
    Frame(Vec<u8>),
    /// Text control frame (`NEW`).
    Control(ControlMessage),
}

#[derive(Debug, Error)]
enum CarrierError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("header value rejected")]
    Header(#[from] InvalidHeaderValue),
    #[error("ROUTE {0:?} is not host:port")]
    InvalidRoute(String),
    #[error("WEBSOCKET_URI {0:?} has no host")]
    InvalidUri(String),
    #[error("TCP connect failed")]
    Io(#[from] std::io::Error),
    #[error("TLS setup failed")]
    Tls(#[from] rustls::Error),
}

/// Handle the engine keeps for the lifetime of one attempt.
pub struct CarrierHandle {
    cmd_tx: mpsc::UnboundedSender<CarrierCommand>,
    task: JoinHandle<()>,
}

impl CarrierHandle {
    /// Hand a command to the carrier. The command channel is unbounded (the
    /// UDP listeners produce, the WebSocket writer consumes); on failure the
    /// command is returned so queued frames are not lost.
    pub fn send(&self, command: CarrierCommand) -> Result<(), CarrierCommand> {
        self.cmd_tx.send(command).map_err(|err| err.0)
    }

    /// Tear the connection down without waiting for the remote close.
    pub fn close(self) {
        self.task.abort();
    }
}

/// Spawn a connection attempt for `epoch`.
pub fn connect(
    config: Arc<ClientConfig>,
    epoch: u64,
    events: mpsc::Sender<EngineEvent>,
) -> CarrierHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(config, epoch, events, cmd_rx));
    CarrierHandle { cmd_tx, task }
}

async fn run(
    config: Arc<ClientConfig>,
    epoch: u64,
    events: mpsc::Sender<EngineEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<CarrierCommand>,
) {
    match establish(&config).await {
        Ok(ws) => {
            drive(ws, &config, epoch, &events, &mut cmd_rx).await;
        }
        Err(err) => {
            warn!(epoch, error = %err, "failed to connect to WebSocket server");
        }
    }
    let _ = events
        .send(EngineEvent::Carrier(CarrierEvent::Closed { epoch }))
        .await;
}

/// Open the TCP(+TLS) connection and complete the WebSocket upgrade with the
/// authentication and route headers attached.
async fn establish(config: &ClientConfig) -> Result<WsStream, CarrierError> {
    let mut request = config.websocket_uri.as_str().into_client_request()?;
    {
        let headers = request.headers_mut();
        headers.insert("X-Auth-Type", HeaderValue::from_static("Token"));
        headers.insert("X-Auth-Token", HeaderValue::from_str(&config.auth_token)?);
        if config.use_old_protocol {
            headers.insert("X-Auth-Route", HeaderValue::from_str(&config.route)?);
        } else {
            let (address, port) = config
                .route
                .split_once(':')
                .ok_or_else(|| CarrierError::InvalidRoute(config.route.clone()))?;
            headers.insert("X-Route-Address", HeaderValue::from_str(address)?);
            headers.insert("X-Route-Port", HeaderValue::from_str(port)?);
        }
    }

    let secure = config.websocket_uri.starts_with("wss");
    let (host, port) = {
        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| CarrierError::InvalidUri(config.websocket_uri.clone()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        (host, port)
    };

    // The stream is built by hand so both TCP_NODELAY and SO_KEEPALIVE can
    // be set before the upgrade.
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    stream.set_nodelay(true)?;
    socket2::SockRef::from(&stream).set_keepalive(true)?;

    let connector = if secure {
        Some(Connector::Rustls(Arc::new(tls_config()?)))
    } else {
        None
    };

    let (ws, _response) = client_async_tls_with_config(request, stream, None, connector).await?;
    Ok(ws)
}

/// TLS 1.2/1.3 only, endpoint identification against the webpki root set.
fn tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?;
    Ok(builder
        .with_root_certificates(roots)
        .with_no_client_auth())
}

async fn drive(
    ws: WsStream,
    config: &ClientConfig,
    epoch: u64,
    events: &mpsc::Sender<EngineEvent>,
    cmd_rx: &mut mpsc::UnboundedReceiver<CarrierCommand>,
) {
    let (mut sink, mut reader) = ws.split();

    // The legacy protocol authenticates with a JSON exchange after the
    // upgrade; the multi-tunnel protocol is authenticated by the upgrade
    // itself.
    if config.use_old_protocol && !legacy_handshake(&mut sink, &mut reader, config).await {
        return;
    }

    info!(epoch, "connected to remote server");
    if events
        .send(EngineEvent::Carrier(CarrierEvent::Connected { epoch }))
        .await
        .is_err()
    {
        return;
    }

    let mut ping = tokio::time::interval(config.ping_interval);
    let mut liveness_tick = tokio::time::interval(Duration::from_secs(1));
    let mut monitor = LivenessMonitor::new(config.ping_timeout, Instant::now());

    loop {
        tokio::select! {
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Binary(frame))) => {
                        if events
                            .send(EngineEvent::Carrier(CarrierEvent::Data { epoch, frame }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text(text.as_str(), config, epoch, events).await {
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => monitor.on_pong(Instant::now()),
                    // The protocol layer answers pings; the server never
                    // originates them anyway.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        warn!(epoch, error = %err, "WebSocket read error");
                        break;
                    }
                }
            }
            command = cmd_rx.recv() => {
                let message = match command {
                    Some(CarrierCommand::Frame(frame)) => Message::Binary(frame.into()),
                    Some(CarrierCommand::Control(control)) => {
                        debug!(epoch, %control, "sending control frame");
                        Message::Text(control.to_string().into())
                    }
                    // Engine dropped the handle.
                    None => break,
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::from_static(PING_PAYLOAD))).await.is_err() {
                    break;
                }
            }
            _ = liveness_tick.tick() => {
                if monitor.on_tick(Instant::now()) {
                    error!(epoch, "max ping failures reached, closing connection");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Legacy route negotiation: send the JSON request, wait for the verdict.
async fn legacy_handshake(sink: &mut WsSink, reader: &mut WsReader, config: &ClientConfig) -> bool {
    let Some((address, port)) = config.route.split_once(':') else {
        error!(route = %config.route, "ROUTE is not host:port");
        return false;
    };
    let Ok(port) = port.parse::<u16>() else {
        error!(route = %config.route, "ROUTE port is not a number");
        return false;
    };
    let request = ConnectRequest {
        address: address.to_string(),
        port,
    };
    let Ok(text) = serde_json::to_string(&request) else {
        return false;
    };
    if sink.send(Message::Text(text.into())).await.is_err() {
        return false;
    }

    loop {
        match reader.next().await {
            Some(Ok(Message::Text(reply))) => {
                return match serde_json::from_str::<ConnectResponse>(reply.as_str()) {
                    Ok(response) if response.is_connected() => true,
                    Ok(response) => {
                        error!(message = %response.message, "failed to connect to remote server");
                        false
                    }
                    Err(err) => {
                        error!(error = %err, "failed to parse connection response");
                        false
                    }
                };
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) | Some(Err(_)) | None => return false,
        }
    }
}

/// Multi-tunnel text frames: tunnel grants and evictions.
async fn handle_text(
    text: &str,
    config: &ClientConfig,
    epoch: u64,
    events: &mpsc::Sender<EngineEvent>,
) -> bool {
    if config.use_old_protocol {
        // Only the handshake reply is expected, and it was consumed above.
        warn!(text, "unexpected text frame on legacy connection");
        return true;
    }
    match ControlMessage::parse(text) {
        Some(ControlMessage::SocketId(tunnel_id)) => {
            info!(tunnel_id, "created UDP tunnel");
            events
                .send(EngineEvent::Carrier(CarrierEvent::TunnelGranted {
                    epoch,
                    tunnel_id,
                }))
                .await
                .is_ok()
        }
        Some(ControlMessage::CloseId(tunnel_id)) => {
            info!(tunnel_id, "server closed UDP tunnel");
            events
                .send(EngineEvent::Carrier(CarrierEvent::TunnelClosed {
                    epoch,
                    tunnel_id,
                }))
                .await
                .is_ok()
        }
        _ => {
            warn!(text, "received unknown text frame");
            true
        }
    }
}
