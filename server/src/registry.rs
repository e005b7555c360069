//! Per-connection tunnel bookkeeping.
//!
//! A [`TunnelRegistry`] is owned by exactly one connection task and is never
//! shared; all mutation happens on that task, so there are no locks here.
//! Ids are allocated monotonically from 1 and never reused within a
//! connection. The first tunnel is special: it is exempt from idle reaping
//! for the life of the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use streamsockets_common::protocol::FIRST_TUNNEL_ID;

/// One server-side tunnel: a connected UDP socket plus its activity stamp.
pub struct Tunnel {
    pub socket: Arc<UdpSocket>,
    pub remote: SocketAddr,
    last_activity: Instant,
    /// Downstream pump reading from the UDP socket, aborted on close.
    task: Option<JoinHandle<()>>,
}

impl Tunnel {
    fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct TunnelRegistry {
    tunnels: HashMap<u8, Tunnel>,
    next_id: u16,
    first_id: Option<u8>,
    max_tunnels: usize,
}

impl TunnelRegistry {
    pub fn new(max_tunnels: usize) -> Self {
        Self {
            tunnels: HashMap::new(),
            next_id: u16::from(FIRST_TUNNEL_ID),
            first_id: None,
            max_tunnels,
        }
    }

    /// Register a tunnel and allocate its id. Returns `None` when the
    /// per-connection cap is reached or the one-byte id space is exhausted.
    pub fn create(&mut self, socket: Arc<UdpSocket>, remote: SocketAddr) -> Option<u8> {
        if self.tunnels.len() >= self.max_tunnels || self.next_id > u16::from(u8::MAX) {
            return None;
        }
        let id = self.next_id as u8;
        self.next_id += 1;
        self.first_id.get_or_insert(id);
        self.tunnels.insert(
            id,
            Tunnel {
                socket,
                remote,
                last_activity: Instant::now(),
                task: None,
            },
        );
        Some(id)
    }

    /// Attach the downstream pump once it has been spawned for `id`.
    pub fn attach_task(&mut self, id: u8, task: JoinHandle<()>) {
        if let Some(tunnel) = self.tunnels.get_mut(&id) {
            tunnel.task = Some(task);
        } else {
            task.abort();
        }
    }

    pub fn get(&self, id: u8) -> Option<&Tunnel> {
        self.tunnels.get(&id)
    }

    /// Refresh the activity stamp. Returns whether the tunnel exists.
    pub fn touch(&mut self, id: u8) -> bool {
        match self.tunnels.get_mut(&id) {
            Some(tunnel) => {
                tunnel.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a tunnel, closing its UDP socket and stopping its pump.
    pub fn close(&mut self, id: u8) -> bool {
        match self.tunnels.remove(&id) {
            Some(tunnel) => {
                tunnel.close();
                true
            }
            None => false,
        }
    }

    /// Close every tunnel idle for longer than `timeout`, except the
    /// first-created one. Returns the ids that were closed.
    pub fn reap_idle(&mut self, timeout: Duration) -> Vec<u8> {
        let now = Instant::now();
        let first = self.first_id;
        let mut reaped: Vec<u8> = self
            .tunnels
            .iter()
            .filter(|(id, tunnel)| {
                Some(**id) != first && now.duration_since(tunnel.last_activity) > timeout
            })
            .map(|(id, _)| *id)
            .collect();
        reaped.sort_unstable();
        for id in &reaped {
            if let Some(tunnel) = self.tunnels.remove(id) {
                tunnel.close();
            }
        }
        reaped
    }

    pub fn close_all(&mut self) {
        for (_, tunnel) in self.tunnels.drain() {
            tunnel.close();
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn first_id(&self) -> Option<u8> {
        self.first_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn dummy_socket() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Arc::new(socket), addr)
    }

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let mut registry = TunnelRegistry::new(10);
        let (socket, addr) = dummy_socket().await;
        assert_eq!(registry.create(Arc::clone(&socket), addr), Some(1));
        assert_eq!(registry.create(Arc::clone(&socket), addr), Some(2));
        assert!(registry.close(1));
        // Closed ids are never reused.
        assert_eq!(registry.create(socket, addr), Some(3));
        assert_eq!(registry.first_id(), Some(1));
    }

    #[tokio::test]
    async fn cap_blocks_creation() {
        let mut registry = TunnelRegistry::new(2);
        let (socket, addr) = dummy_socket().await;
        assert!(registry.create(Arc::clone(&socket), addr).is_some());
        assert!(registry.create(Arc::clone(&socket), addr).is_some());
        assert!(registry.create(Arc::clone(&socket), addr).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn reaping_spares_the_first_tunnel() {
        let mut registry = TunnelRegistry::new(10);
        let (socket, addr) = dummy_socket().await;
        registry.create(Arc::clone(&socket), addr).unwrap();
        registry.create(Arc::clone(&socket), addr).unwrap();
        registry.create(socket, addr).unwrap();

        // Everything is idle relative to a zero timeout, but tunnel 1 stays.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = registry.reap_idle(Duration::from_millis(1));
        assert_eq!(reaped, vec![2, 3]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());
    }

    #[tokio::test]
    async fn touch_protects_from_reaping() {
        let mut registry = TunnelRegistry::new(10);
        let (socket, addr) = dummy_socket().await;
        registry.create(Arc::clone(&socket), addr).unwrap();
        registry.create(socket, addr).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.touch(2));
        let reaped = registry.reap_idle(Duration::from_millis(5));
        assert!(reaped.is_empty());
        assert!(!registry.touch(99));
    }
}
