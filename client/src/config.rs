//! Client configuration, resolved from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `THREADS` | `1` (number of UDP listener sockets) |
//! | `BIND_ADDRESS` | `0.0.0.0` |
//! | `BIND_PORT` | `9000` |
//! | `WEBSOCKET_URI` | `ws://localhost:8080/tunnel` |
//! | `AUTH_TOKEN` | empty |
//! | `ROUTE` | `127.0.0.1:8888` |
//! | `USE_OLD_PROTOCOL` | `false` |
//! | `PING_INTERVAL_MILLIS` | `5000` |
//! | `PING_TIMEOUT_MILLIS` | `10000` |
//! | `RETRY_INITIAL_DELAY_SECONDS` | `1` |
//! | `RETRY_MAX_DELAY_SECONDS` | `30` |
//! | `UDP_TIMEOUT` | `300` (seconds of UDP silence before the carrier closes) |
//! | `EXIT_ON_FAILURE` | `false` |

use std::time::Duration;

use streamsockets_common::env::{env_flag, env_value, env_value_parsed};

/// Immutable client options, shared via `Arc` between the engine and carrier.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// UDP listener sockets to bind. More than one uses `SO_REUSEPORT`.
    pub threads: usize,
    pub bind_address: String,
    pub bind_port: u16,
    pub websocket_uri: String,
    pub auth_token: String,
    /// Backend the server should forward to, as `host:port`.
    pub route: String,
    pub use_old_protocol: bool,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    /// UDP silence threshold after which the carrier is closed; the next
    /// datagram re-establishes it.
    pub udp_timeout: Duration,
    /// Exit the process on connection failure instead of retrying, for
    /// supervisor-managed deployments.
    pub exit_on_failure: bool,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            threads: env_value_parsed("THREADS", 1).max(1),
            bind_address: env_value("BIND_ADDRESS", "0.0.0.0"),
            bind_port: env_value_parsed("BIND_PORT", 9000),
            websocket_uri: env_value("WEBSOCKET_URI", "ws://localhost:8080/tunnel"),
            auth_token: env_value("AUTH_TOKEN", ""),
            route: env_value("ROUTE", "127.0.0.1:8888"),
            use_old_protocol: env_flag("USE_OLD_PROTOCOL", false),
            ping_interval: Duration::from_millis(env_value_parsed("PING_INTERVAL_MILLIS", 5000)),
            ping_timeout: Duration::from_millis(env_value_parsed("PING_TIMEOUT_MILLIS", 10000)),
            retry_initial_delay: Duration::from_secs(env_value_parsed(
                "RETRY_INITIAL_DELAY_SECONDS",
                1,
            )),
            retry_max_delay: Duration::from_secs(env_value_parsed("RETRY_MAX_DELAY_SECONDS", 30)),
            udp_timeout: Duration::from_secs(env_value_parsed("UDP_TIMEOUT", 300)),
            exit_on_failure: env_flag("EXIT_ON_FAILURE", false),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            bind_address: "0.0.0.0".to_string(),
            bind_port: 9000,
            websocket_uri: "ws://localhost:8080/tunnel".to_string(),
            auth_token: String::new(),
            route: "127.0.0.1:8888".to_string(),
            use_old_protocol: false,
            ping_interval: Duration::from_millis(5000),
            ping_timeout: Duration::from_millis(10000),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            udp_timeout: Duration::from_secs(300),
            exit_on_failure: false,
        }
    }
}
