//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `CHATBRIDGE_DISCORD_TOKEN` - Discord bot token
//! - `CHATBRIDGE_ROLE` - process role (platform or game)
//! - `CHATBRIDGE_IDENTITY` - local display name
//! - `CHATBRIDGE_STATE_FILE` - endpoint state file path

use std::env;

use crate::config::types::{Config, DiscordConfig};

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "CHATBRIDGE";

/// Apply environment variable overrides to a config.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(token) = env::var(format!("{}_DISCORD_TOKEN", ENV_PREFIX)) {
        match config.discord.as_mut() {
            Some(discord) => discord.token = token,
            None => {
                config.discord = Some(DiscordConfig {
                    token,
                    command_prefix: "!bridge".to_string(),
                })
            }
        }
    }

    if let Ok(role) = env::var(format!("{}_ROLE", ENV_PREFIX)) {
        config.relay.role = role;
    }
    if let Ok(identity) = env::var(format!("{}_IDENTITY", ENV_PREFIX)) {
        if !identity.is_empty() {
            config.relay.identity = Some(identity);
        }
    }
    if let Ok(path) = env::var(format!("{}_STATE_FILE", ENV_PREFIX)) {
        config.relay.state_file = path;
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `CHATBRIDGE_CONFIG`, otherwise returns "chatbridge.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "chatbridge.conf".to_string())
}
