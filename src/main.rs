//! Relay bot - anonymous two-way relay between users and one owner
//!
//! Users message the bot; the owner sees who wrote and can reply, message
//! anyone directly, or broadcast, without revealing their own identity.

mod config;
mod db;
mod runtime;
mod state_machine;
mod telegram;

use config::BotConfig;
use db::Database;
use runtime::{
    run_sweep, ChannelGate, DatabaseDirectory, MembershipGate, OpenGate, ProductionCoordinator,
    RelayCoordinator,
};
use std::path::Path;
use std::sync::Arc;
use telegram::{run_poller, TelegramClient};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_bot=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let config = BotConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let client = Arc::new(TelegramClient::new(
        &config.token,
        &config.api_base,
        config.poll_timeout,
    )?);
    let me = client.get_me().await?;
    tracing::info!(bot_id = me.id, username = ?me.username, owner_id = config.owner_id, "Connected to Bot API");

    let gate: Arc<dyn MembershipGate> = match &config.force_channel {
        Some(channel) => {
            tracing::info!(channel = %channel, "Channel membership required");
            Arc::new(ChannelGate::new(client.clone(), channel.clone()))
        }
        None => Arc::new(OpenGate),
    };

    let coordinator: Arc<ProductionCoordinator> = Arc::new(RelayCoordinator::new(
        config.relay_settings(),
        DatabaseDirectory::new(db),
        gate,
        client.clone(),
    ));

    let cancel = CancellationToken::new();
    let sweep = tokio::spawn(run_sweep(
        coordinator.clone(),
        config.sweep_settings(),
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    });

    let polled = run_poller(client, coordinator, config.poll_timeout, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = sweep.await {
        tracing::warn!(error = %e, "Sweep task ended abnormally");
    }
    polled?;

    tracing::info!("Relay bot stopped");
    Ok(())
}
