//! Discord bot client.
//!
//! Wraps the serenity client: builds it with the intents the relay needs,
//! keeps it running with backoff and shuts the gateway down on cancellation.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use serenity::http::Http;
use serenity::prelude::*;
use serenity::Client;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::discord::handler::BridgeHandler;

/// Create an exponential backoff iterator for Discord reconnection.
/// 5s initial, 5min max, factor 1.1, with jitter, unlimited retries.
fn discord_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(5))
        .with_max_delay(Duration::from_secs(300))
        .with_factor(1.1)
        .with_jitter()
        .without_max_times()
        .build()
}

async fn build_client(token: &str, handler: BridgeHandler) -> anyhow::Result<Client> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS;

    let client = Client::builder(token, intents)
        .event_handler(handler)
        .await?;
    Ok(client)
}

pub struct DiscordBot {
    client: Option<Client>,
    token: String,
    handler: BridgeHandler,
}

impl DiscordBot {
    /// Build the bot. Nothing connects until [`DiscordBot::run`].
    pub async fn build(token: &str, handler: BridgeHandler) -> anyhow::Result<Self> {
        let client = build_client(token, handler.clone()).await?;
        Ok(Self {
            client: Some(client),
            token: token.to_string(),
            handler,
        })
    }

    /// REST client for posting messages. Independent of the gateway connection.
    pub fn http(&self) -> Arc<Http> {
        match &self.client {
            Some(client) => client.http.clone(),
            None => Arc::new(Http::new(&self.token)),
        }
    }

    /// Run the gateway until cancelled, rebuilding the client after failures.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = discord_backoff();

        loop {
            info!("Connecting to Discord...");
            let mut client = match self.client.take() {
                Some(client) => client,
                None => match build_client(&self.token, self.handler.clone()).await {
                    Ok(client) => {
                        backoff = discord_backoff();
                        client
                    }
                    Err(e) => {
                        error!("Failed to rebuild Discord client: {}", e);
                        let delay = backoff.next().unwrap_or(Duration::from_secs(300));
                        warn!("Retrying in {:.1}s...", delay.as_secs_f64());
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(delay) => continue,
                        }
                    }
                },
            };

            let shard_manager = client.shard_manager.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Initiating graceful Discord shutdown...");
                    shard_manager.shutdown_all().await;
                    info!("Discord shutdown complete");
                    break;
                }
                result = client.start() => match result {
                    Ok(()) => {
                        info!("Discord client disconnected normally");
                        break;
                    }
                    Err(e) => {
                        error!("Discord client error: {}", e);
                        let delay = backoff.next().unwrap_or(Duration::from_secs(300));
                        warn!("Discord disconnected. Reconnecting in {:.1}s...", delay.as_secs_f64());
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(delay) => {}
                        }
                    }
                },
            }
        }
        info!("Discord task ended");
    }
}
