//! Discord message event handling.
//!
//! Guild text messages become channel observations for the relay; messages
//! starting with the command prefix go to the operator command surface.

use std::sync::Arc;

use fancy_regex::Regex;
use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::commands::{strip_prefix, CommandSurface};
use crate::bridge::formatter::{split_message, PLATFORM_MAX_LEN};
use crate::common::messages::InboundEvent;
use crate::common::types::{ChannelId, Site};

/// Discord event handler.
#[derive(Clone)]
pub struct BridgeHandler {
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    commands: Arc<CommandSurface>,
    command_prefix: String,
    identity_tx: Arc<watch::Sender<Option<String>>>,
    mention_pattern: Regex,
}

impl BridgeHandler {
    pub fn new(
        inbound_tx: mpsc::UnboundedSender<InboundEvent>,
        commands: Arc<CommandSurface>,
        command_prefix: impl Into<String>,
        identity_tx: Arc<watch::Sender<Option<String>>>,
    ) -> Self {
        Self {
            inbound_tx,
            commands,
            command_prefix: command_prefix.into(),
            identity_tx,
            mention_pattern: Regex::new(r"<@!?(\d+)>").expect("Invalid mention regex"),
        }
    }

    async fn handle_command(&self, ctx: &Context, msg: &Message, args: &str) {
        info!("{} command from {}: {}", self.command_prefix, msg.author.name, args);
        let reply = self.commands.handle(args).await;
        for chunk in split_message(&reply, PLATFORM_MAX_LEN) {
            if let Err(e) = msg.channel_id.say(&ctx.http, chunk).await {
                error!("Failed to send command reply: {}", e);
                break;
            }
        }
    }
}

/// Convert user mentions to `@name` using the users the message mentions.
///
/// Unknown ids are left as they are.
fn resolve_mentions(pattern: &Regex, content: &str, names: &[(u64, String)]) -> String {
    pattern
        .replace_all(content, |caps: &fancy_regex::Captures| -> String {
            if let Ok(user_id) = caps[1].parse::<u64>() {
                if let Some((_, name)) = names.iter().find(|(id, _)| *id == user_id) {
                    return format!("@{}", name);
                }
            }
            caps[0].to_string()
        })
        .to_string()
}

/// Display name: server nickname, then global name, then user name.
fn author_name(msg: &Message) -> String {
    msg.member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| msg.author.global_name.clone())
        .unwrap_or_else(|| msg.author.name.clone())
}

#[async_trait]
impl EventHandler for BridgeHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        // Only handle guild (server) messages
        if msg.guild_id.is_none() {
            return;
        }

        // Our own posts still feed the dedup tables; other bots are ignored
        let own = msg.author.id == ctx.cache.current_user().id;
        if msg.author.bot && !own {
            return;
        }

        let content = msg.content.trim();
        if content.is_empty() && msg.attachments.is_empty() {
            return;
        }

        if !own {
            if let Some(args) = strip_prefix(content, &self.command_prefix) {
                self.handle_command(&ctx, &msg, args).await;
                return;
            }
        }

        // Build message content including attachments
        let names: Vec<(u64, String)> = msg
            .mentions
            .iter()
            .map(|user| (user.id.get(), user.global_name.clone().unwrap_or_else(|| user.name.clone())))
            .collect();
        let mut full_content = resolve_mentions(&self.mention_pattern, content, &names);
        for attachment in &msg.attachments {
            if !full_content.is_empty() {
                full_content.push(' ');
            }
            full_content.push_str(&attachment.url);
        }

        let event = InboundEvent::new(
            Site::Channel(ChannelId(msg.channel_id.get())),
            author_name(&msg),
            full_content,
        )
        .with_origin_id(Some(msg.id.to_string()))
        .from_self(own);

        debug!("Discord message observed in {} (own: {})", msg.channel_id, own);
        if self.inbound_tx.send(event).is_err() {
            warn!("Relay is gone, dropping Discord message");
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);

        // The configured identity wins over the bot name
        let name = ready.user.name.clone();
        self.identity_tx.send_if_modified(|identity| {
            if identity.is_none() {
                *identity = Some(name);
                true
            } else {
                false
            }
        });
    }
}
