//! Client entry point: binds the local UDP port and keeps the tunnel to the
//! server alive until SIGINT/SIGTERM.

use clap::Parser;
use tracing::info;

use streamsockets_client::config::ClientConfig;
use streamsockets_client::Client;

/// StreamSockets client: forwards local UDP datagrams over a WebSocket tunnel.
#[derive(Parser)]
#[command(name = "streamsockets-client", version)]
struct Cli {
    /// WebSocket URI of the server (overrides WEBSOCKET_URI).
    #[arg(long)]
    uri: Option<String>,
    /// Backend route as host:port (overrides ROUTE).
    #[arg(long)]
    route: Option<String>,
    /// Authentication token (overrides AUTH_TOKEN).
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let mut config = ClientConfig::from_env();
    if let Some(uri) = cli.uri {
        config.websocket_uri = uri;
    }
    if let Some(route) = cli.route {
        config.route = route;
    }
    if let Some(token) = cli.token {
        config.auth_token = token;
    }

    info!(
        "streamsockets-client v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    if config.exit_on_failure {
        info!("EXIT_ON_FAILURE is enabled, the process exits on connection failure");
    }

    let client = Client::start(config).await.expect("Failed to start UDP listener");

    shutdown_signal().await;
    info!("Shutting down...");
    client.shutdown().await;
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
