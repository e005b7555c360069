//! Server configuration, resolved from environment variables.
//!
//! Every option has a compiled default; the accounts file path can also be
//! overridden on the command line (`--accounts`). Recognized variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `ACCOUNTS_CONFIG_FILE` | `accounts.yaml` |
//! | `ACCOUNTS_RELOAD_INTERVAL_SECONDS` | `15` |
//! | `CLIENT_IP_HEADER` | unset (use peer address) |
//! | `PARENT_THREADS` / `CHILD_THREADS` | `0` (runtime default) |
//! | `BIND_ADDRESS` | `0.0.0.0` |
//! | `BIND_PORT` | `8080` |
//! | `HTTP_MAX_CONTENT_LENGTH` | `65536` |
//! | `MAX_FRAME_SIZE` | `65536` |
//! | `WS_PATH` | `/tunnel` |
//! | `UDP_TUNNEL_TIMEOUT_SECONDS` | `300` |
//! | `MAX_UDP_TUNNELS_PER_CLIENT` | `10` |
//! | `METRICS_ENABLED` | `true` |
//! | `METRICS_BIND_ADDRESS` | `0.0.0.0` |
//! | `METRICS_PORT` | `9090` |
//! | `METRICS_PATH` | `/metrics` |

use std::time::Duration;

use streamsockets_common::env::{env_flag, env_value, env_value_opt, env_value_parsed};

/// Immutable server options, shared via `Arc` across all connection handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Path the WebSocket upgrade is served on.
    pub ws_path: String,
    pub accounts_config_file: String,
    pub accounts_reload_interval: Duration,
    /// Header to read the client IP from, for deployments behind a proxy.
    /// When unset the TCP peer address is used.
    pub client_ip_header: Option<String>,
    /// Acceptor threads. The acceptor and worker pools share one tokio
    /// runtime; the worker count is the sum of both settings.
    pub parent_threads: usize,
    pub child_threads: usize,
    pub http_max_content_length: usize,
    /// Maximum WebSocket frame payload length.
    pub max_frame_size: usize,
    /// Inactivity threshold after which non-first tunnels are reaped.
    pub udp_tunnel_timeout: Duration,
    pub max_udp_tunnels_per_client: usize,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
    pub metrics_port: u16,
    pub metrics_path: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_value("BIND_ADDRESS", "0.0.0.0"),
            bind_port: env_value_parsed("BIND_PORT", 8080),
            ws_path: env_value("WS_PATH", "/tunnel"),
            accounts_config_file: env_value("ACCOUNTS_CONFIG_FILE", "accounts.yaml"),
            accounts_reload_interval: Duration::from_secs(env_value_parsed(
                "ACCOUNTS_RELOAD_INTERVAL_SECONDS",
                15,
            )),
            client_ip_header: env_value_opt("CLIENT_IP_HEADER"),
            parent_threads: env_value_parsed("PARENT_THREADS", 0),
            child_threads: env_value_parsed("CHILD_THREADS", 0),
            http_max_content_length: env_value_parsed("HTTP_MAX_CONTENT_LENGTH", 65536),
            max_frame_size: env_value_parsed("MAX_FRAME_SIZE", 65536),
            udp_tunnel_timeout: Duration::from_secs(env_value_parsed(
                "UDP_TUNNEL_TIMEOUT_SECONDS",
                300,
            )),
            max_udp_tunnels_per_client: env_value_parsed("MAX_UDP_TUNNELS_PER_CLIENT", 10),
            metrics_enabled: env_flag("METRICS_ENABLED", true),
            metrics_bind_address: env_value("METRICS_BIND_ADDRESS", "0.0.0.0"),
            metrics_port: env_value_parsed("METRICS_PORT", 9090),
            metrics_path: env_value("METRICS_PATH", "/metrics"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
            ws_path: "/tunnel".to_string(),
            accounts_config_file: "accounts.yaml".to_string(),
            accounts_reload_interval: Duration::from_secs(15),
            client_ip_header: None,
            parent_threads: 0,
            child_threads: 0,
            http_max_content_length: 65536,
            max_frame_size: 65536,
            udp_tunnel_timeout: Duration::from_secs(300),
            max_udp_tunnels_per_client: 10,
            metrics_enabled: true,
            metrics_bind_address: "0.0.0.0".to_string(),
            metrics_port: 9090,
            metrics_path: "/metrics".to_string(),
        }
    }
}
