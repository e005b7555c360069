//! Server entry point: loads configuration and the account store, spawns the
//! accounts reload task and the metrics listener, and serves the tunnel
//! endpoint until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use streamsockets_server::auth::TokenAuthenticator;
use streamsockets_server::config::ServerConfig;
use streamsockets_server::metrics::{self, Metrics};
use streamsockets_server::{router, AppState};

/// StreamSockets server: bridges authenticated WebSocket tunnels to UDP backends.
#[derive(Parser)]
#[command(name = "streamsockets-server", version)]
struct Cli {
    /// Path to the YAML accounts file (overrides ACCOUNTS_CONFIG_FILE).
    #[arg(long)]
    accounts: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let mut config = ServerConfig::from_env();
    if let Some(path) = cli.accounts {
        config.accounts_config_file = path;
    }

    // PARENT_THREADS/CHILD_THREADS size one shared runtime: tokio does not
    // split acceptor and worker pools.
    let threads = config.parent_threads + config.child_threads;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if threads > 0 {
        builder.worker_threads(threads);
    }
    builder
        .build()
        .expect("Failed to build tokio runtime")
        .block_on(run(config));
}

async fn run(config: ServerConfig) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!(
        "streamsockets-server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let auth = match TokenAuthenticator::from_file(&config.accounts_config_file) {
        Ok(auth) => Arc::new(auth),
        Err(err) => {
            error!(
                file = %config.accounts_config_file,
                error = %err,
                "failed to load accounts file"
            );
            std::process::exit(1);
        }
    };
    let metrics = Arc::new(Metrics::new());
    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&config), Arc::clone(&auth), Arc::clone(&metrics));

    // Periodic accounts reload; a failed reload keeps the current generation.
    let reload_interval = config.accounts_reload_interval;
    let reload_auth = Arc::clone(&auth);
    let reload_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + reload_interval,
            reload_interval,
        );
        loop {
            interval.tick().await;
            reload_auth.reload();
        }
    });

    let metrics_task = if config.metrics_enabled {
        let addr = format!("{}:{}", config.metrics_bind_address, config.metrics_port);
        let listener = TcpListener::bind(&addr)
            .await
            .expect("Failed to bind metrics listener");
        info!("MetricsServer started on {addr}{}", config.metrics_path);
        let metrics_router = metrics::router(Arc::clone(&metrics), &config.metrics_path);
        Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, metrics_router).await {
                error!(error = %err, "metrics server error");
            }
        }))
    } else {
        None
    };

    let addr = format!("{}:{}", config.bind_address, config.bind_port);
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    info!("WebSocket server listening on {addr}{}", config.ws_path);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    info!("Shutting down...");
    reload_task.abort();
    if let Some(task) = metrics_task {
        task.abort();
    }
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
