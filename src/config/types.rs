//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;

use crate::common::reconnect::ConnectionPolicy;
use crate::common::types::Role;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub relay: RelayConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub formats: FormatsConfig,
}

impl Config {
    /// Role of this process. Validation guarantees the string parses.
    pub fn role(&self) -> Role {
        Role::parse(&self.relay.role).unwrap_or(Role::Platform)
    }

    /// Connection timing policy.
    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            reconnect_interval: Duration::from_millis(self.connection.reconnect_interval_ms),
            probe_attempts: self.connection.probe_attempts,
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.connection.heartbeat_interval_ms),
            identity_wait: Duration::from_millis(self.connection.identity_wait_ms),
            bind_host: self.connection.bind_host.clone(),
        }
    }
}

/// Process-wide relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// "platform" or "game".
    pub role: String,
    /// Local display name sent to peers (bot or player name).
    pub identity: Option<String>,
    /// Inbound worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// JSON file holding endpoint definitions.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_workers() -> usize {
    2
}

fn default_state_file() -> String {
    "chatbridge-state.json".to_string()
}

/// One configured bridge endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Display name, also the merge key against the state file.
    pub name: String,
    /// "listen" or "connect".
    pub mode: String,
    /// Remote host for connect mode.
    pub host: Option<String>,
    pub port: u16,
    /// Platform channel id this endpoint maps to.
    pub channel: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Forward game chat to the platform channel.
    #[serde(default = "default_true")]
    pub forward: bool,
}

fn default_true() -> bool {
    true
}

/// Duplicate and echo suppression policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub origin_ttl_ms: u64,
    pub echo_ttl_ms: u64,
    pub max_entries: usize,
    /// Regexes removed from text before fingerprinting.
    pub strip: Vec<String>,
    /// Regexes whose first capture group is the unwrapped message.
    pub unwrap: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            origin_ttl_ms: 5000,
            echo_ttl_ms: 5000,
            max_entries: 2000,
            strip: vec!["§.".to_string()],
            unwrap: vec![r"^<[^>]+>\s*(.*)$".to_string(), r"^\[[^\]]+\]\s*(.*)$".to_string()],
        }
    }
}

/// Connection timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_interval_ms: u64,
    pub probe_attempts: u32,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub identity_wait_ms: u64,
    pub bind_host: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 5000,
            probe_attempts: 10,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 30_000,
            identity_wait_ms: 15_000,
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

/// Discord bot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

fn default_command_prefix() -> String {
    "!bridge".to_string()
}

/// Message format strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormatsConfig {
    pub to_platform: String,
    pub to_platform_system: String,
    /// Prefix added when several endpoints share one channel.
    pub tag: String,
    pub to_game: String,
    pub escape_markdown: bool,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            to_platform: "%user: %message".to_string(),
            to_platform_system: "%message".to_string(),
            tag: "[%endpoint] ".to_string(),
            to_game: "[%user] %message".to_string(),
            escape_markdown: true,
        }
    }
}
