//! chatbridge - game chat <-> Discord relay
//!
//! Runs either next to the game (listening for platform bots) or next to the
//! Discord bot (dialing game hosts), relaying chat both ways without echoes.

mod bridge;
mod common;
mod config;
mod discord;
mod game;
mod protocol;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge::{ChannelBundle, CommandSurface, EndpointRegistry, GameSink, Relay, Sinks, StatusMonitor};
use common::types::Role;
use config::{env::get_config_path, load_and_validate, merge_endpoints, EndpointStore, JsonFileStore};
use discord::{BridgeHandler, DiscordBot, DiscordSink};
use game::{run_console, ConsoleGame};
use transport::ConnectionManager;

/// Upper bound on waiting for background tasks at shutdown.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Player name used in the game role when none is configured.
const DEFAULT_PLAYER_NAME: &str = "Player";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("chatbridge v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    let role = config.role();
    info!("Configuration loaded successfully");
    info!("  Role: {:?}", role);
    info!("  Endpoints: {}", config.endpoints.len());
    info!("  State file: {}", config.relay.state_file);

    // ============================================================
    // Endpoints: configuration merged with the state file
    // ============================================================
    let store: Arc<dyn EndpointStore> = Arc::new(JsonFileStore::new(&config.relay.state_file));
    let stored = store.load().unwrap_or_else(|e| {
        warn!("Ignoring unreadable state file: {}", e);
        Vec::new()
    });
    let endpoints = merge_endpoints(&config.endpoints, &stored);
    if let Err(e) = store.save(&endpoints) {
        warn!("Failed to write state file: {}", e);
    }
    for endpoint in &endpoints {
        info!(
            "  {} [{}] port {} -> channel {}{}",
            endpoint.name,
            endpoint.id,
            endpoint.port(),
            endpoint.channel,
            if endpoint.enabled { "" } else { " (disabled)" }
        );
    }
    let registry = EndpointRegistry::new(endpoints);

    // ============================================================
    // Core: channels, connection manager, command surface
    // ============================================================
    let channels = ChannelBundle::new(config.relay.identity.clone());
    let inbound_tx = channels.inbound.inbound_tx.clone();
    let identity_tx = Arc::new(channels.identity.identity_tx);

    let manager = ConnectionManager::new(
        registry.clone(),
        role,
        config.connection_policy(),
        inbound_tx.clone(),
        channels.status.events_tx.clone(),
        channels.identity.identity_rx.clone(),
    );
    let commands = Arc::new(CommandSurface::new(registry.clone(), manager.clone(), store.clone()));
    let cancel = CancellationToken::new();

    // ============================================================
    // Role adapter
    // ============================================================
    let (sinks, game, adapter_task): (Sinks, Option<Arc<dyn GameSink>>, JoinHandle<()>) = match role {
        Role::Platform => {
            let discord = config
                .discord
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("platform role requires a discord section"))?;
            let handler = BridgeHandler::new(
                inbound_tx.clone(),
                commands.clone(),
                discord.command_prefix.clone(),
                identity_tx.clone(),
            );
            let bot = DiscordBot::build(&discord.token, handler).await?;
            let sinks = Sinks::platform(Arc::new(DiscordSink::new(bot.http())));
            info!("Starting Discord bot...");
            (sinks, None, tokio::spawn(bot.run(cancel.clone())))
        }
        Role::Game => {
            let identity = config
                .relay
                .identity
                .clone()
                .unwrap_or_else(|| DEFAULT_PLAYER_NAME.to_string());
            identity_tx.send_replace(Some(identity.clone()));
            let console = Arc::new(ConsoleGame::new(identity, inbound_tx.clone()));
            let task = tokio::spawn(run_console(console.clone(), commands.clone(), cancel.clone()));
            let game: Arc<dyn GameSink> = console;
            (Sinks::game(game.clone()), Some(game), task)
        }
    };

    // ============================================================
    // Relay workers, janitor, status consumer
    // ============================================================
    let relay = Arc::new(Relay::new(&config, registry.clone(), manager.clone(), sinks));
    let mut tasks = relay.spawn_workers(config.relay.workers, channels.inbound.inbound_rx, cancel.clone());
    tasks.push(relay.spawn_janitor(cancel.clone()));

    let monitor = StatusMonitor::new(registry.clone(), store.clone(), game);
    tasks.push(tokio::spawn(monitor.run(channels.status.events_rx, cancel.clone())));

    // ============================================================
    // Connections
    // ============================================================
    manager.activate_enabled();
    tasks.push(manager.spawn_reconciler());

    shutdown_signal().await;
    info!("Shutdown signal received - closing connections...");

    cancel.cancel();
    manager.shutdown().await;
    tasks.push(adapter_task);
    for task in tasks {
        match tokio::time::timeout(TASK_STOP_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Task panicked: {}", e),
            Err(_) => warn!("Task did not stop in time"),
        }
    }

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
