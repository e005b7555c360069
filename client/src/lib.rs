//! # streamsockets-client
//!
//! Listens for UDP datagrams on a local port and forwards them over a
//! WebSocket tunnel to a `streamsockets-server`, which bridges them to the
//! configured backend route. Responses travel the same path in reverse.
//!
//! ## Architecture
//!
//! ```text
//! main.rs     — entry point, clap overrides, shutdown
//! config.rs   — environment-driven options
//! engine.rs   — datagram engine: sender↔tunnel maps, queueing, epochs
//! carrier.rs  — one WebSocket connection attempt: headers, TLS, I/O loop
//! liveness.rs — pong deadline and consecutive-failure bookkeeping
//! retry.rs    — exponential reconnect backoff
//! ```
//!
//! The library surface exists so the integration test suite can run the
//! client in-process against an in-process server.

pub mod carrier;
pub mod config;
pub mod engine;
pub mod liveness;
pub mod retry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use config::ClientConfig;
use engine::{DatagramEngine, EngineEvent, EngineStatus};

/// Largest datagram a UDP socket can deliver.
const MAX_DATAGRAM: usize = 65535;

/// A running client: UDP listeners plus the datagram engine.
pub struct Client {
    inbox_tx: mpsc::Sender<EngineEvent>,
    engine_task: JoinHandle<()>,
    listener_tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    status: Arc<EngineStatus>,
}

impl Client {
    /// Bind the UDP listeners and start the engine. The first connection
    /// attempt begins immediately.
    pub async fn start(config: ClientConfig) -> std::io::Result<Self> {
        let config = Arc::new(config);
        let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
            .parse()
            .map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{err}"))
            })?;

        // With more than one listener every socket shares the port via
        // SO_REUSEPORT and the kernel spreads datagrams across them.
        let reuse_port = config.threads > 1;
        let first = bind_udp(bind_addr, reuse_port)?;
        let local_addr = first.local_addr()?;
        let mut sockets = vec![Arc::new(first)];
        for _ in 1..config.threads {
            sockets.push(Arc::new(bind_udp(local_addr, reuse_port)?));
        }
        info!(
            %local_addr,
            listeners = sockets.len(),
            reuse_port,
            "UDP server started"
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        let status = Arc::new(EngineStatus::default());
        let engine = DatagramEngine::new(
            Arc::clone(&config),
            Arc::clone(&sockets[0]),
            inbox_tx.clone(),
            Arc::clone(&status),
        );
        let engine_task = tokio::spawn(engine.run(inbox_rx));

        let listener_tasks = sockets
            .iter()
            .map(|socket| tokio::spawn(listen(Arc::clone(socket), inbox_tx.clone())))
            .collect();

        Ok(Self {
            inbox_tx,
            engine_task,
            listener_tasks,
            local_addr,
            status,
        })
    }

    /// The bound UDP address local applications send to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection-state snapshot: epoch, connecting, ready.
    pub fn status(&self) -> &Arc<EngineStatus> {
        &self.status
    }

    /// Stop the listeners and the engine, closing the carrier.
    pub async fn shutdown(self) {
        for task in &self.listener_tasks {
            task.abort();
        }
        let _ = self.inbox_tx.send(EngineEvent::Shutdown).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.engine_task).await;
    }
}

/// Bind a UDP socket with 1 MiB buffers and optional SO_REUSEPORT.
fn bind_udp(addr: SocketAddr, reuse_port: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    if let Err(err) = socket.set_recv_buffer_size(1024 * 1024) {
        warn!(error = %err, "failed to raise UDP recv buffer");
    }
    if let Err(err) = socket.set_send_buffer_size(1024 * 1024) {
        warn!(error = %err, "failed to raise UDP send buffer");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Forward every received datagram into the engine inbox.
async fn listen(socket: Arc<UdpSocket>, inbox: mpsc::Sender<EngineEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, sender)) => {
                let event = EngineEvent::Datagram {
                    payload: buf[..len].to_vec(),
                    sender,
                };
                if inbox.send(event).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "UDP recv error");
            }
        }
    }
}
