//! Datagram engine: the client-side state machine.
//!
//! One task owns every piece of per-connection state — the sender↔tunnel
//! maps, the frame queue, the connection epoch, and the `connecting`/`ready`
//! flags — and consumes a single inbox of events: local UDP datagrams,
//! carrier events, retry timers, and shutdown. Nothing here needs a lock.
//!
//! ## Epochs
//!
//! Every fresh connect attempt increments the epoch. Carrier events and
//! retry timers carry the epoch they were created under; anything stale is a
//! no-op. That is the whole defense against callbacks from abandoned
//! connection attempts.
//!
//! ## Queueing and tunnel id 0
//!
//! Frames that cannot be sent yet (carrier not ready, or no tunnel id
//! granted) are queued with the reserved placeholder id 0 in their first
//! byte, tagged with their sender. When a grant associates the sender with
//! an id, the placeholder byte is rewritten and the frames flush in arrival
//! order. The queue survives reconnects; ids do not, so every queued frame
//! reverts to the placeholder when a connection dies.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use streamsockets_common::protocol::{
    decode_data_frame, encode_data_frame, ControlMessage, RESERVED_TUNNEL_ID,
};

use crate::carrier::{self, CarrierCommand, CarrierEvent, CarrierHandle};
use crate::config::ClientConfig;
use crate::retry::RetryController;

/// Everything that can wake the engine.
#[derive(Debug)]
pub enum EngineEvent {
    /// A datagram arrived on a local UDP listener.
    Datagram { payload: Vec<u8>, sender: SocketAddr },
    Carrier(CarrierEvent),
    /// A backoff timer elapsed; reconnect if `epoch` is still current.
    Retry { epoch: u64 },
    Shutdown,
}

/// Read-only view of the engine's connection state, shared with callers.
#[derive(Default)]
pub struct EngineStatus {
    epoch: AtomicU64,
    connecting: AtomicBool,
    ready: AtomicBool,
}

impl EngineStatus {
    pub fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// A frame waiting for the carrier or for a tunnel grant. On the
/// multi-tunnel protocol `frame[0]` is the tunnel id byte (0 until granted);
/// on the legacy protocol `frame` is the raw payload.
struct QueuedFrame {
    sender: SocketAddr,
    frame: Vec<u8>,
}

pub struct DatagramEngine {
    config: Arc<ClientConfig>,
    inbox_tx: mpsc::Sender<EngineEvent>,
    /// Socket used to deliver server responses back to local senders.
    udp: Arc<UdpSocket>,
    status: Arc<EngineStatus>,
    retry: RetryController,
    epoch: u64,
    connecting: bool,
    ready: bool,
    /// Set when the engine closes the carrier on purpose (UDP inactivity);
    /// the resulting `Closed` event must not trigger a retry.
    expect_close: bool,
    carrier: Option<CarrierHandle>,
    /// The first local sender seen; bound to the first granted tunnel.
    default_endpoint: Option<SocketAddr>,
    default_tunnel_id: u8,
    addr_to_tunnel: HashMap<SocketAddr, u8>,
    tunnel_to_addr: HashMap<u8, SocketAddr>,
    /// Senders that asked for a tunnel, in request order; grants are
    /// associated FIFO.
    pending_senders: VecDeque<SocketAddr>,
    queued: VecDeque<QueuedFrame>,
    last_udp_packet: Instant,
}

impl DatagramEngine {
    pub fn new(
        config: Arc<ClientConfig>,
        udp: Arc<UdpSocket>,
        inbox_tx: mpsc::Sender<EngineEvent>,
        status: Arc<EngineStatus>,
    ) -> Self {
        let retry = RetryController::new(config.retry_initial_delay, config.retry_max_delay);
        Self {
            config,
            inbox_tx,
            udp,
            status,
            retry,
            epoch: 0,
            connecting: false,
            ready: false,
            expect_close: false,
            carrier: None,
            default_endpoint: None,
            default_tunnel_id: RESERVED_TUNNEL_ID,
            addr_to_tunnel: HashMap::new(),
            tunnel_to_addr: HashMap::new(),
            pending_senders: VecDeque::new(),
            queued: VecDeque::new(),
            last_udp_packet: Instant::now(),
        }
    }

    /// Run until shutdown. Connects immediately, then reacts to events.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<EngineEvent>) {
        self.start_connect();
        let mut inactivity = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                event = inbox.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = inactivity.tick() => self.check_udp_inactivity(),
            }
        }
        if let Some(handle) = self.carrier.take() {
            handle.close();
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Datagram { payload, sender } => {
                self.on_datagram(payload, sender);
                true
            }
            EngineEvent::Carrier(event) => self.on_carrier(event).await,
            EngineEvent::Retry { epoch } => {
                if epoch == self.epoch && self.carrier.is_none() && !self.connecting {
                    self.start_connect();
                }
                true
            }
            EngineEvent::Shutdown => false,
        }
    }

    fn on_datagram(&mut self, payload: Vec<u8>, sender: SocketAddr) {
        self.last_udp_packet = Instant::now();

        // A connection closed for inactivity comes back on the next packet.
        if self.carrier.is_none() && !self.connecting {
            self.start_connect();
        }

        if self.default_endpoint.is_none() {
            info!(%sender, "default endpoint registered");
            self.default_endpoint = Some(sender);
            if self.default_tunnel_id != RESERVED_TUNNEL_ID {
                self.addr_to_tunnel.insert(sender, self.default_tunnel_id);
                self.tunnel_to_addr.insert(self.default_tunnel_id, sender);
            }
        } else if self.default_endpoint != Some(sender) {
            if self.config.use_old_protocol {
                self.switch_legacy_sender(payload, sender);
                return;
            }
            if !self.addr_to_tunnel.contains_key(&sender) {
                if !self.pending_senders.contains(&sender) {
                    info!(%sender, "requesting new UDP tunnel");
                    self.pending_senders.push_back(sender);
                    self.request_new_tunnel();
                }
                self.queued.push_back(QueuedFrame {
                    sender,
                    frame: encode_data_frame(RESERVED_TUNNEL_ID, &payload),
                });
                return;
            }
        }

        let frame = if self.config.use_old_protocol {
            payload
        } else {
            let id = self
                .addr_to_tunnel
                .get(&sender)
                .copied()
                .unwrap_or(self.default_tunnel_id);
            encode_data_frame(id, &payload)
        };

        let awaiting_grant =
            !self.config.use_old_protocol && frame[0] == RESERVED_TUNNEL_ID;
        if self.ready && !awaiting_grant {
            self.send_or_requeue(QueuedFrame { sender, frame });
        } else {
            self.queued.push_back(QueuedFrame { sender, frame });
        }
    }

    /// The legacy protocol supports one route per connection: a new sender
    /// takes over as the default endpoint on a fresh connection.
    fn switch_legacy_sender(&mut self, payload: Vec<u8>, sender: SocketAddr) {
        info!(%sender, "new sender on legacy protocol, reconnecting");
        self.default_endpoint = Some(sender);
        self.queued.push_back(QueuedFrame {
            sender,
            frame: payload,
        });
        if let Some(handle) = self.carrier.take() {
            handle.close();
        }
        self.ready = false;
        self.connecting = false;
        self.clear_tunnel_state();
        self.start_connect();
    }

    async fn on_carrier(&mut self, event: CarrierEvent) -> bool {
        match event {
            CarrierEvent::Connected { epoch } => {
                if epoch != self.epoch {
                    return true;
                }
                self.connecting = false;
                self.ready = true;
                self.retry.reset();
                self.publish_status();
                // Tunnel ids never survive a reconnect: senders with queued
                // frames must ask again.
                let waiting: Vec<SocketAddr> = {
                    let mut seen = Vec::new();
                    for item in &self.queued {
                        if Some(item.sender) != self.default_endpoint
                            && !seen.contains(&item.sender)
                        {
                            seen.push(item.sender);
                        }
                    }
                    seen
                };
                for sender in waiting {
                    if !self.pending_senders.contains(&sender) {
                        self.pending_senders.push_back(sender);
                    }
                }
                for _ in 0..self.pending_senders.len() {
                    self.request_new_tunnel();
                }
                self.try_flush();
                true
            }
            CarrierEvent::TunnelGranted { epoch, tunnel_id } => {
                if epoch != self.epoch {
                    return true;
                }
                self.on_tunnel_granted(tunnel_id);
                self.try_flush();
                true
            }
            CarrierEvent::TunnelClosed { epoch, tunnel_id } => {
                if epoch != self.epoch {
                    return true;
                }
                if let Some(addr) = self.tunnel_to_addr.remove(&tunnel_id) {
                    self.addr_to_tunnel.remove(&addr);
                    info!(tunnel_id, %addr, "tunnel closed");
                }
                true
            }
            CarrierEvent::Data { epoch, frame } => {
                if epoch == self.epoch {
                    self.deliver_to_udp(&frame).await;
                }
                true
            }
            CarrierEvent::Closed { epoch } => {
                if epoch != self.epoch {
                    return true;
                }
                self.on_carrier_closed()
            }
        }
    }

    fn on_tunnel_granted(&mut self, tunnel_id: u8) {
        if self.default_tunnel_id == RESERVED_TUNNEL_ID {
            self.default_tunnel_id = tunnel_id;
            if let Some(default) = self.default_endpoint {
                self.addr_to_tunnel.insert(default, tunnel_id);
                self.tunnel_to_addr.insert(tunnel_id, default);
            }
            info!(tunnel_id, "default tunnel created");
        } else if let Some(sender) = self.pending_senders.pop_front() {
            self.addr_to_tunnel.insert(sender, tunnel_id);
            self.tunnel_to_addr.insert(tunnel_id, sender);
            info!(tunnel_id, %sender, "tunnel created");
        } else {
            warn!(tunnel_id, "unsolicited tunnel grant");
        }
    }

    /// Forward a server frame to the local sender it belongs to.
    async fn deliver_to_udp(&mut self, frame: &[u8]) {
        if self.config.use_old_protocol {
            if let Some(endpoint) = self.default_endpoint {
                if let Err(err) = self.udp.send_to(frame, endpoint).await {
                    debug!(error = %err, "UDP delivery failed");
                }
            }
            return;
        }
        let Some((tunnel_id, payload)) = decode_data_frame(frame) else {
            warn!("received binary frame with no tunnel id");
            return;
        };
        let Some(endpoint) = self.tunnel_to_addr.get(&tunnel_id).copied() else {
            warn!(tunnel_id, "received data for unknown tunnel id");
            return;
        };
        if let Err(err) = self.udp.send_to(payload, endpoint).await {
            debug!(tunnel_id, error = %err, "UDP delivery failed");
        }
    }

    /// Returns `false` only when the process must exit.
    fn on_carrier_closed(&mut self) -> bool {
        self.carrier = None;
        self.ready = false;
        self.connecting = false;
        self.clear_tunnel_state();
        self.publish_status();

        if self.expect_close {
            self.expect_close = false;
            return true;
        }

        if self.config.exit_on_failure {
            error!("connection failed and EXIT_ON_FAILURE is set, exiting");
            std::process::exit(1);
        }

        warn!("WebSocket connection closed, will retry");
        let epoch = self.epoch;
        let inbox = self.inbox_tx.clone();
        self.retry.schedule(async move {
            let _ = inbox.send(EngineEvent::Retry { epoch }).await;
        });
        true
    }

    fn start_connect(&mut self) {
        if self.connecting {
            return;
        }
        self.connecting = true;
        self.expect_close = false;
        self.epoch += 1;
        self.publish_status();
        info!(
            epoch = self.epoch,
            uri = %self.config.websocket_uri,
            "connecting to WebSocket server"
        );
        let handle = carrier::connect(
            Arc::clone(&self.config),
            self.epoch,
            self.inbox_tx.clone(),
        );
        self.carrier = Some(handle);
    }

    fn request_new_tunnel(&mut self) {
        if !self.ready {
            return;
        }
        if let Some(carrier) = &self.carrier {
            let _ = carrier.send(CarrierCommand::Control(ControlMessage::New));
        }
    }

    /// Flush queued frames whose tunnel id is known; frames still waiting on
    /// a grant stay queued, in order.
    fn try_flush(&mut self) {
        if !self.ready || self.carrier.is_none() {
            return;
        }
        let mut remaining = VecDeque::new();
        while let Some(mut item) = self.queued.pop_front() {
            if self.config.use_old_protocol {
                if Some(item.sender) != self.default_endpoint {
                    // A stale frame from a sender that lost the connection.
                    continue;
                }
            } else {
                let id = self
                    .addr_to_tunnel
                    .get(&item.sender)
                    .copied()
                    .unwrap_or(RESERVED_TUNNEL_ID);
                if id == RESERVED_TUNNEL_ID {
                    remaining.push_back(item);
                    continue;
                }
                item.frame[0] = id;
            }
            let Some(carrier) = &self.carrier else {
                remaining.push_back(item);
                break;
            };
            if let Err(CarrierCommand::Frame(frame)) =
                carrier.send(CarrierCommand::Frame(item.frame))
            {
                remaining.push_back(QueuedFrame {
                    sender: item.sender,
                    frame,
                });
                break;
            }
        }
        remaining.extend(self.queued.drain(..));
        self.queued = remaining;
    }

    /// Send now if possible, otherwise keep the frame for the next flush.
    fn send_or_requeue(&mut self, item: QueuedFrame) {
        let Some(carrier) = &self.carrier else {
            self.queued.push_back(item);
            return;
        };
        if let Err(CarrierCommand::Frame(frame)) =
            carrier.send(CarrierCommand::Frame(item.frame))
        {
            self.queued.push_back(QueuedFrame {
                sender: item.sender,
                frame,
            });
        }
    }

    /// Close the carrier after prolonged UDP silence; the next datagram
    /// re-establishes it.
    fn check_udp_inactivity(&mut self) {
        if self.carrier.is_none() {
            return;
        }
        if self.last_udp_packet.elapsed() <= self.config.udp_timeout {
            return;
        }
        info!(
            timeout_secs = self.config.udp_timeout.as_secs(),
            "no UDP traffic, closing WebSocket"
        );
        self.expect_close = true;
        if let Some(handle) = self.carrier.take() {
            handle.close();
        }
        self.ready = false;
        self.connecting = false;
        self.clear_tunnel_state();
        self.publish_status();
    }

    /// Drop per-connection tunnel state. Queued frames survive, but their id
    /// bytes revert to the placeholder: ids belong to the dead connection.
    fn clear_tunnel_state(&mut self) {
        self.addr_to_tunnel.clear();
        self.tunnel_to_addr.clear();
        self.pending_senders.clear();
        self.default_tunnel_id = RESERVED_TUNNEL_ID;
        if !self.config.use_old_protocol {
            for item in &mut self.queued {
                item.frame[0] = RESERVED_TUNNEL_ID;
            }
        }
    }

    fn publish_status(&self) {
        self.status.epoch.store(self.epoch, Ordering::Release);
        self.status
            .connecting
            .store(self.connecting, Ordering::Release);
        self.status.ready.store(self.ready, Ordering::Release);
    }
}
