//! Line console standing in for the game client.
//!
//! Typed lines are the player's outgoing chat, `/discordchat ...` runs an
//! operator command and `<Name> text` simulates another player talking.
//! Injected chat is printed as the player's own line and reported back
//! through the display path, exactly as a game client shows it.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::commands::{strip_prefix, CommandSurface};
use crate::bridge::sink::GameSink;
use crate::common::error::SendError;
use crate::common::messages::InboundEvent;
use crate::game::chat::{to_inbound, GameEvent};

/// Command prefix on the game side.
pub const COMMAND_PREFIX: &str = "/discordchat";

pub struct ConsoleGame {
    identity: String,
    events: mpsc::UnboundedSender<InboundEvent>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleGame {
    pub fn new(identity: impl Into<String>, events: mpsc::UnboundedSender<InboundEvent>) -> Self {
        Self::with_output(identity, events, Box::new(std::io::stdout()))
    }

    pub fn with_output(
        identity: impl Into<String>,
        events: mpsc::UnboundedSender<InboundEvent>,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            identity: identity.into(),
            events,
            out: Mutex::new(out),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn print(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            debug!("Console write failed: {}", e);
        }
    }

    fn report(&self, event: GameEvent) {
        if let Some(event) = to_inbound(event, &self.identity) {
            if self.events.send(event).is_err() {
                warn!("Relay is gone, dropping game event");
            }
        }
    }

    /// Handle one typed line.
    pub async fn handle_line(&self, line: &str, commands: &CommandSurface) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(args) = strip_prefix(line, COMMAND_PREFIX) {
            let reply = commands.handle(args).await;
            for reply_line in reply.lines() {
                self.print(&format!("[DiscordChat] {}", reply_line));
            }
        } else if line.starts_with('<') {
            self.print(line);
            self.report(GameEvent::Displayed {
                text: line.to_string(),
                is_overlay: false,
            });
        } else if line.starts_with('/') {
            self.print(&format!("Unknown command: {}", line));
        } else {
            self.print(&format!("<{}> {}", self.identity, line));
            self.report(GameEvent::OutgoingChat {
                text: line.to_string(),
            });
        }
    }
}

#[async_trait]
impl GameSink for ConsoleGame {
    async fn send_chat_or_command(&self, text: &str) -> Result<(), SendError> {
        if text.starts_with('/') {
            info!("Executing relayed command: {}", text);
            self.print(&format!("Executed {}", text));
            return Ok(());
        }

        let line = format!("<{}> {}", self.identity, text);
        self.print(&line);
        self.report(GameEvent::Displayed {
            text: line,
            is_overlay: false,
        });
        Ok(())
    }

    async fn show_notice(&self, text: &str) {
        self.print(text);
    }
}

/// Read stdin until EOF or cancellation.
pub async fn run_console(console: Arc<ConsoleGame>, commands: Arc<CommandSurface>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Console ready, chatting as {}", console.identity());

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => console.handle_line(&line, &commands).await,
            Ok(None) => {
                info!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        }
    }
}
