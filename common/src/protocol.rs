//! Wire formats carried on the WebSocket.
//!
//! Two protocol generations share the carrier:
//!
//! - **Multi-tunnel** (default): binary frames are `[tunnel_id: u8][payload]`,
//!   and tunnel lifecycle is negotiated with plain-text control frames
//!   (`NEW`, `SOCKET ID: <n>`, `CLOSE ID: <n>`).
//! - **Legacy**: binary frames are the raw UDP payload for the connection's
//!   single tunnel, and the route is negotiated with a JSON text frame.
//!
//! Tunnel ids occupy a single byte. Id 0 is reserved: the client stamps it on
//! frames queued before the server has granted an id, and rewrites it to the
//! granted id before the frame ever reaches the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder id stamped on frames queued before a tunnel grant arrives.
pub const RESERVED_TUNNEL_ID: u8 = 0;

/// Tunnel ids are allocated from 1; the first tunnel on a connection is 1.
pub const FIRST_TUNNEL_ID: u8 = 1;

/// Payload carried in liveness pings. Opaque to the server, which echoes it.
pub const PING_PAYLOAD: &[u8] = b"PING";

/// Prepend a tunnel id to a UDP payload, producing a multi-tunnel data frame.
pub fn encode_data_frame(tunnel_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(tunnel_id);
    frame.extend_from_slice(payload);
    frame
}

/// Split a multi-tunnel data frame into `(tunnel_id, payload)`.
///
/// Returns `None` for an empty frame; a frame consisting of just the id byte
/// decodes to an empty payload (zero-length datagrams are legal UDP).
pub fn decode_data_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    let (&id, payload) = frame.split_first()?;
    Some((id, payload))
}

/// Text control frames of the multi-tunnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client asks the server to open an additional tunnel.
    New,
    /// Server grants a tunnel id.
    SocketId(u8),
    /// Server evicts a tunnel.
    CloseId(u8),
}

impl ControlMessage {
    /// Parse a text frame. Returns `None` for anything that is not a
    /// well-formed control message (the caller logs and drops it).
    pub fn parse(text: &str) -> Option<Self> {
        if text == "NEW" {
            return Some(Self::New);
        }
        if let Some(rest) = text.strip_prefix("SOCKET ID: ") {
            return rest.parse().ok().map(Self::SocketId);
        }
        if let Some(rest) = text.strip_prefix("CLOSE ID: ") {
            return rest.parse().ok().map(Self::CloseId);
        }
        None
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("NEW"),
            Self::SocketId(id) => write!(f, "SOCKET ID: {id}"),
            Self::CloseId(id) => write!(f, "CLOSE ID: {id}"),
        }
    }
}

/// Legacy protocol: first text frame from the client, naming the route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: String,
    pub port: u16,
}

/// Legacy protocol: server's reply to a [`ConnectRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
}

impl ConnectResponse {
    pub fn connected() -> Self {
        Self {
            success: true,
            message: "connected".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Whether this reply completes legacy authentication.
    pub fn is_connected(&self) -> bool {
        self.success && self.message.eq_ignore_ascii_case("connected")
    }
}
