//! Downstream pump: UDP backend → WebSocket client.
//!
//! One task per tunnel. Each datagram read from the tunnel's connected UDP
//! socket becomes one binary WebSocket frame — prefixed with the tunnel id on
//! the multi-tunnel protocol, raw on the legacy protocol. When the outbound
//! channel is full the datagram is dropped, matching UDP semantics: no
//! buffering, no retry.

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use streamsockets_common::protocol::encode_data_frame;

use crate::metrics::Metrics;

/// Largest datagram a UDP socket can deliver.
const MAX_DATAGRAM: usize = 65535;

/// Spawn the pump for one tunnel. The task runs until the socket errors
/// fatally or the connection's outbound channel closes; the tunnel registry
/// aborts it on tunnel close.
pub fn spawn(
    tunnel_id: u8,
    socket: Arc<UdpSocket>,
    out_tx: mpsc::Sender<Message>,
    metrics: Arc<Metrics>,
    account_name: String,
    new_protocol: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = match socket.recv(&mut buf).await {
                Ok(len) => len,
                // A connected UDP socket surfaces ICMP errors (port
                // unreachable) as recv failures; the tunnel stays open.
                Err(err) => {
                    trace!(tunnel_id, error = %err, "UDP recv error");
                    continue;
                }
            };

            let frame = if new_protocol {
                encode_data_frame(tunnel_id, &buf[..len])
            } else {
                buf[..len].to_vec()
            };

            metrics.record_bytes_sent(&account_name, len as u64);

            match out_tx.try_send(Message::Binary(frame.into())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(tunnel_id, len, "WebSocket not writable, dropping datagram");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    })
}

/// Open a UDP socket connected to `remote`, with send/recv buffers raised to
/// 1 MiB. Binding to an unspecified address of the matching family lets the
/// kernel pick the source port.
pub async fn open_udp_socket(remote: std::net::SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
    let bind_addr: std::net::SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    let sock_ref = socket2::SockRef::from(&socket);
    if let Err(err) = sock_ref.set_recv_buffer_size(1024 * 1024) {
        warn!(error = %err, "failed to raise UDP recv buffer");
    }
    if let Err(err) = sock_ref.set_send_buffer_size(1024 * 1024) {
        warn!(error = %err, "failed to raise UDP send buffer");
    }

    socket.connect(remote).await?;
    Ok(Arc::new(socket))
}
