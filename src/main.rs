//! ircbridge - Matrix application service bridging rooms to IRC networks
//!
//! Registers with a homeserver as an application service and puppets one IRC
//! connection per room-side user, plus a bot per network.

mod bridge;
mod common;
mod config;
mod irc;
mod matrix;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info, warn, Level};

use bridge::orchestrator::{build_servers, check_startup, generate_registration, prepare_store};
use bridge::registration::REGISTRATION_FILE;
use bridge::{Bridge, BridgeContext, ChannelBundle};
use common::metrics::LogMetrics;
use config::env::get_config_path;
use config::load_and_validate;
use irc::{ConnectionDeps, StoreNames, TcpConnector};
use matrix::{listener, HttpRemoteClient};
use store::IdentityStore;

#[derive(Parser)]
#[command(name = "ircbridge")]
#[command(about = "Matrix application service bridging rooms to IRC", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write the application service registration and exit
    #[arg(short = 'r', long)]
    generate_registration: bool,

    /// Start even if the network configuration changed since the registration
    #[arg(short, long)]
    skip_crc_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("ircbridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.clone().unwrap_or_else(get_config_path);
    info!("Loading configuration from {}...", config_path);

    let config = match load_and_validate(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure {} exists and is properly formatted.", config_path);
            std::process::exit(1);
        }
    };

    info!("Configuration loaded successfully");
    info!("  Homeserver: {} ({})", config.homeserver.url, config.homeserver.domain);
    info!("  Database: {}", config.database_uri);
    info!("  Networks: {}", config.servers.keys().cloned().collect::<Vec<_>>().join(", "));

    let store = Arc::new(IdentityStore::connect(&config.database_uri).await?);
    let servers = build_servers(&config);
    prepare_store(&store, &servers).await?;

    if cli.generate_registration {
        let registration = generate_registration(&config, &store, &servers).await?;
        registration.write(REGISTRATION_FILE).await?;
        info!("Output registration to: {}", REGISTRATION_FILE);
        println!(
            "Registration written to {}. Hand it to your homeserver and restart it.",
            REGISTRATION_FILE
        );
        return Ok(());
    }

    let hs_token = check_startup(&config, &store, &servers, cli.skip_crc_check)
        .await
        .map_err(|e| {
            error!("{}", e);
            e
        })?;

    // ============================================================
    // Wire up collaborators
    // ============================================================

    let channels = ChannelBundle::new();
    let shutdown_tx = channels.control.shutdown_tx;
    let shutdown_rx = channels.bridge.shutdown_rx.clone();

    let remote = Arc::new(HttpRemoteClient::new(
        config.homeserver.url.clone(),
        config.homeserver.domain.clone(),
        config.appservice.token.clone(),
    )?);
    let deps = ConnectionDeps {
        connector: Arc::new(TcpConnector::new()),
        names: Arc::new(StoreNames::new(store.clone())),
    };
    let ctx = Arc::new(BridgeContext::new(
        config.clone(),
        servers,
        store,
        remote,
        deps,
        Arc::new(LogMetrics),
        channels.producers.local_tx,
    ));

    let app = listener::router(&hs_token, channels.producers.listener_tx);
    let mut listener_task = tokio::spawn(listener::serve(config.appservice.port, app));

    let bridge = Bridge::new(ctx);
    bridge.start(shutdown_rx).await?;
    let mut bridge_task = tokio::spawn(bridge.run(channels.bridge));

    // ============================================================
    // Run until a signal or a task ends
    // ============================================================
    let shutdown = tokio::select! {
        biased;
        _ = shutdown_signal() => {
            info!("Shutdown signal received - disconnecting from IRC...");
            true
        }
        result = &mut listener_task => {
            match result {
                Ok(Ok(())) => warn!("Listener stopped"),
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Listener task panicked: {}", e),
            }
            true
        }
        _ = &mut bridge_task => false,
    };

    if shutdown {
        if let Err(e) = shutdown_tx.send(true) {
            debug!("Shutdown channel closed (bridge already exited): {}", e);
        }
        let timeout = Duration::from_secs(10);
        match tokio::time::timeout(timeout, bridge_task).await {
            Ok(Ok(())) => info!("Bridge stopped gracefully"),
            Ok(Err(e)) => warn!("Bridge task panicked: {}", e),
            Err(_) => warn!("Bridge shutdown timed out"),
        }
    }
    listener_task.abort();

    info!("Exiting...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
