//! Local chat surfaces the relay writes into.

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::error::SendError;
use crate::common::types::ChannelId;

/// The messaging platform hosted by this process.
#[async_trait]
pub trait PlatformSink: Send + Sync {
    /// Post `text` to `channel`. Returns the id of the created message.
    async fn send(&self, channel: ChannelId, text: &str) -> Result<String, SendError>;
}

/// The game hosted by this process.
#[async_trait]
pub trait GameSink: Send + Sync {
    /// Say `text` in chat, or run it as a command when it starts with `/`.
    async fn send_chat_or_command(&self, text: &str) -> Result<(), SendError>;

    /// Show a line to the local player only. Never relayed.
    async fn show_notice(&self, text: &str);
}

/// Whichever local surfaces this role provides.
#[derive(Clone, Default)]
pub struct Sinks {
    pub platform: Option<Arc<dyn PlatformSink>>,
    pub game: Option<Arc<dyn GameSink>>,
}

impl Sinks {
    pub fn platform(sink: Arc<dyn PlatformSink>) -> Self {
        Self {
            platform: Some(sink),
            game: None,
        }
    }

    pub fn game(sink: Arc<dyn GameSink>) -> Self {
        Self {
            platform: None,
            game: Some(sink),
        }
    }
}
