//! Posting relayed text into Discord channels.

use std::sync::Arc;

use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::id::ChannelId as DiscordChannelId;

use crate::bridge::sink::PlatformSink;
use crate::common::error::SendError;
use crate::common::types::ChannelId;

pub struct DiscordSink {
    http: Arc<Http>,
}

impl DiscordSink {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PlatformSink for DiscordSink {
    async fn send(&self, channel: ChannelId, text: &str) -> Result<String, SendError> {
        if channel.0 == 0 {
            return Err(SendError::Platform("channel id 0".to_string()));
        }
        let message = DiscordChannelId::new(channel.0)
            .say(&self.http, text)
            .await
            .map_err(|e| SendError::Platform(e.to_string()))?;
        Ok(message.id.to_string())
    }
}
