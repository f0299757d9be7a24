//! JSON text frames.
//!
//! Every WebSocket text message is one JSON object discriminated by `type`:
//! - `discord_message` - platform chat heading to the game
//! - `minecraft_message` - game chat heading to the platform
//! - `ping` / `pong` - liveness
//! - `connection_status` - advisory peer metadata sent on connect

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::common::error::FrameError;

/// Author used when a chat frame omits it.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

fn unknown_author() -> String {
    UNKNOWN_AUTHOR.to_string()
}

/// Message ids are opaque: peers send them as strings or as bare numbers.
fn opaque_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "messageId must be a string or a number, got {}",
            other
        ))),
    }
}

/// `status` values carried by `connection_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    #[serde(other)]
    Other,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    DiscordMessage {
        #[serde(default = "unknown_author")]
        author: String,
        #[serde(default)]
        content: String,
        #[serde(
            rename = "messageId",
            default,
            deserialize_with = "opaque_id",
            skip_serializing_if = "Option::is_none"
        )]
        message_id: Option<String>,
    },
    MinecraftMessage {
        #[serde(default = "unknown_author")]
        author: String,
        #[serde(default)]
        content: String,
    },
    Ping,
    Pong,
    ConnectionStatus {
        status: ConnectionStatus,
        #[serde(default)]
        message: String,
        #[serde(rename = "playerName", default, skip_serializing_if = "Option::is_none")]
        player_name: Option<String>,
    },
}

impl Frame {
    /// Build the identity announcement sent when a peer connects.
    pub fn connected(message: impl Into<String>, player_name: Option<String>) -> Self {
        Frame::ConnectionStatus {
            status: ConnectionStatus::Connected,
            message: message.into(),
            player_name,
        }
    }

    /// The frame's `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::DiscordMessage { .. } => "discord_message",
            Frame::MinecraftMessage { .. } => "minecraft_message",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::ConnectionStatus { .. } => "connection_status",
        }
    }
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for well-formed JSON with an unknown `type`; those are
/// ignored rather than treated as malformed.
pub fn decode(text: &str) -> Result<Option<Frame>, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match kind.as_str() {
        "discord_message" | "minecraft_message" | "ping" | "pong" | "connection_status" => {
            Ok(Some(serde_json::from_value(value)?))
        }
        other => {
            debug!("Ignoring frame of unknown type '{}'", other);
            Ok(None)
        }
    }
}

/// Encode a frame as JSON text.
pub fn encode(frame: &Frame) -> String {
    // A Frame is plain strings and enums; serialization cannot fail.
    serde_json::to_string(frame).unwrap_or_default()
}
