//! Shared types used across the application.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a bridge endpoint.
///
/// Generated once (ULID) and persisted with the endpoint definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a channel on the messaging platform (a Discord channel id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which chat surface this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The messaging platform lives here; endpoints lead to game clients.
    Platform,
    /// The game lives here; endpoints lead to platform bots.
    Game,
}

impl Role {
    /// Parse a role from a config/env string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "platform" | "discord" => Some(Role::Platform),
            "game" | "minecraft" => Some(Role::Game),
            _ => None,
        }
    }
}

/// A place where messages enter or leave the relay.
///
/// Used as message origin, delivery destination, echo scope and queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Site {
    /// A bridge endpoint and whatever is on the far side of it.
    Endpoint(EndpointId),
    /// A platform channel hosted by this process.
    Channel(ChannelId),
    /// The game hosted by this process.
    Game,
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Endpoint(id) => write!(f, "endpoint:{}", id),
            Site::Channel(id) => write!(f, "channel:{}", id),
            Site::Game => f.write_str("game"),
        }
    }
}

/// Connection lifecycle state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Probing alternate ports after the configured one failed.
    PortRetry,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::PortRetry => "port-retry",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author name used for non-player text observed in the game.
pub const SYSTEM_AUTHOR: &str = "System";
