//! Configuration validation.
//!
//! Collects every problem before failing so the operator sees them all at once.

use std::collections::HashMap;

use crate::common::error::ConfigError;
use crate::common::types::Role;
use crate::config::types::Config;

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    let role = Role::parse(&config.relay.role);
    if role.is_none() {
        errors.push(format!(
            "relay.role '{}' is invalid (use: platform, game)",
            config.relay.role
        ));
    }
    if config.relay.workers == 0 {
        errors.push("relay.workers must be at least 1".to_string());
    }
    if config.relay.state_file.is_empty() {
        errors.push("relay.state_file is required".to_string());
    }

    // Platform role needs a bot token
    if role == Some(Role::Platform) {
        match &config.discord {
            None => errors.push("discord.token is required in platform role".to_string()),
            Some(discord) if discord.token.is_empty() => {
                errors.push("discord.token is required in platform role".to_string())
            }
            Some(discord) if discord.token == "YOUR_DISCORD_TOKEN_HERE" => errors.push(
                "discord.token has not been configured (still using placeholder)".to_string(),
            ),
            Some(_) => {}
        }
    }

    let mut names: HashMap<String, usize> = HashMap::new();
    let mut listen_ports: HashMap<u16, usize> = HashMap::new();
    let mut remotes: HashMap<(String, u16), usize> = HashMap::new();
    for (i, endpoint) in config.endpoints.iter().enumerate() {
        if endpoint.name.trim().is_empty() {
            errors.push(format!("endpoints[{}].name is required", i));
        } else if let Some(prev) = names.insert(endpoint.name.to_lowercase(), i) {
            errors.push(format!(
                "endpoints[{}].name '{}' duplicates endpoints[{}]",
                i, endpoint.name, prev
            ));
        }

        match endpoint.mode.to_lowercase().as_str() {
            "listen" => {
                if endpoint.enabled {
                    if let Some(prev) = listen_ports.insert(endpoint.port, i) {
                        errors.push(format!(
                            "endpoints[{}].port {} is already used by endpoints[{}]",
                            i, endpoint.port, prev
                        ));
                    }
                }
            }
            "connect" => match endpoint.host.as_deref().filter(|h| !h.is_empty()) {
                None => errors.push(format!("endpoints[{}].host is required in connect mode", i)),
                Some(host) => {
                    if let Some(prev) = remotes.insert((host.to_lowercase(), endpoint.port), i) {
                        errors.push(format!(
                            "endpoints[{}] address {}:{} is already used by endpoints[{}]",
                            i, host, endpoint.port, prev
                        ));
                    }
                }
            },
            other => errors.push(format!(
                "endpoints[{}].mode '{}' is invalid (use: listen, connect)",
                i, other
            )),
        }

        if endpoint.port < 1024 {
            errors.push(format!(
                "endpoints[{}].port must be between 1024 and 65535 (got {})",
                i, endpoint.port
            ));
        }
        if endpoint.channel == 0 {
            errors.push(format!("endpoints[{}].channel must be non-zero", i));
        }
    }

    for (field, patterns) in [("strip", &config.dedup.strip), ("unwrap", &config.dedup.unwrap)] {
        for (i, pattern) in patterns.iter().enumerate() {
            if fancy_regex::Regex::new(pattern).is_err() {
                errors.push(format!(
                    "dedup.{}[{}] is not a valid regex: '{}'",
                    field, i, pattern
                ));
            }
        }
    }
    if config.dedup.origin_ttl_ms < 3000 {
        errors.push(format!(
            "dedup.origin_ttl_ms must be at least 3000 (got {})",
            config.dedup.origin_ttl_ms
        ));
    }
    if !(3000..=5000).contains(&config.dedup.echo_ttl_ms) {
        errors.push(format!(
            "dedup.echo_ttl_ms must be between 3000 and 5000 (got {})",
            config.dedup.echo_ttl_ms
        ));
    }
    if config.dedup.max_entries == 0 {
        errors.push("dedup.max_entries must be non-zero".to_string());
    }

    if config.connection.reconnect_interval_ms == 0 {
        errors.push("connection.reconnect_interval_ms must be non-zero".to_string());
    }
    if config.connection.connect_timeout_ms == 0 {
        errors.push("connection.connect_timeout_ms must be non-zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
