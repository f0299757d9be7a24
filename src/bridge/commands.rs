//! Operator commands (`!bridge status`, `/discordchat port 25590`, ...).
//!
//! Thin wrappers over the registry and the connection manager, shared by the
//! Discord handler and the game console.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::registry::{Endpoint, EndpointAddress, EndpointRegistry};
use crate::common::error::{CommandError, ConnectionError};
use crate::common::types::ConnectionState;
use crate::config::store::EndpointStore;
use crate::transport::ConnectionManager;

pub const MIN_PORT: i64 = 1024;
pub const MAX_PORT: i64 = 65535;

pub const HELP: &str = "Commands: status | port [endpoint] [port] | reconnect [endpoint] | \
disconnect [endpoint] | enable <endpoint> | disable <endpoint>";

/// A parsed operator command. Endpoint references are ids or display names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Help,
    /// Show the port when `value` is `None`, otherwise change it.
    Port {
        endpoint: Option<String>,
        value: Option<String>,
    },
    Reconnect { endpoint: Option<String> },
    Disconnect { endpoint: Option<String> },
    Enable { endpoint: Option<String> },
    Disable { endpoint: Option<String> },
}

impl Command {
    /// Parse the text after the command prefix.
    pub fn parse(args: &str) -> Result<Self, CommandError> {
        let mut words = args.split_whitespace();
        let name = words.next().unwrap_or("status").to_lowercase();
        let rest: Vec<&str> = words.collect();
        let first = rest.first().map(|s| s.to_string());

        let command = match name.as_str() {
            "status" => Command::Status,
            "help" => Command::Help,
            "port" => match rest.as_slice() {
                [] => Command::Port {
                    endpoint: None,
                    value: None,
                },
                // A lone number is a port for the only endpoint
                [single] if single.parse::<i64>().is_ok() => Command::Port {
                    endpoint: None,
                    value: Some(single.to_string()),
                },
                [single] => Command::Port {
                    endpoint: Some(single.to_string()),
                    value: None,
                },
                [endpoint, value, ..] => Command::Port {
                    endpoint: Some(endpoint.to_string()),
                    value: Some(value.to_string()),
                },
            },
            "reconnect" => Command::Reconnect { endpoint: first },
            "disconnect" => Command::Disconnect { endpoint: first },
            "enable" => Command::Enable { endpoint: first },
            "disable" => Command::Disable { endpoint: first },
            _ => return Err(CommandError::UnknownCommand(name)),
        };
        Ok(command)
    }
}

/// Return the arguments when `line` starts with `prefix` as a whole word.
pub fn strip_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = line.trim_start().strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Parse and validate a port argument.
pub fn parse_port(value: &str) -> Result<u16, CommandError> {
    let port: i64 = value
        .trim()
        .parse()
        .map_err(|_| CommandError::InvalidPort(value.to_string()))?;
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(CommandError::PortOutOfRange(port));
    }
    u16::try_from(port).map_err(|_| CommandError::PortOutOfRange(port))
}

/// Executes operator commands.
pub struct CommandSurface {
    registry: EndpointRegistry,
    manager: ConnectionManager,
    store: Arc<dyn EndpointStore>,
}

impl CommandSurface {
    pub fn new(registry: EndpointRegistry, manager: ConnectionManager, store: Arc<dyn EndpointStore>) -> Self {
        Self {
            registry,
            manager,
            store,
        }
    }

    /// Parse and run one command line, always producing reply text.
    pub async fn handle(&self, args: &str) -> String {
        let result = match Command::parse(args) {
            Ok(command) => self.execute(command).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            warn!("Command '{}' failed: {}", args, e);
            e.to_string()
        })
    }

    pub async fn execute(&self, command: Command) -> Result<String, CommandError> {
        match command {
            Command::Status => Ok(self.status_text()),
            Command::Help => Ok(HELP.to_string()),
            Command::Port {
                endpoint,
                value: None,
            } => {
                let endpoint = self.resolve(endpoint.as_deref())?;
                Ok(format!("{} uses port {}", endpoint.name, endpoint.port()))
            }
            Command::Port {
                endpoint,
                value: Some(value),
            } => {
                let port = parse_port(&value)?;
                let endpoint = self.resolve(endpoint.as_deref())?;
                self.change_port(&endpoint, port).await
            }
            Command::Reconnect { endpoint } => {
                let endpoint = self.resolve(endpoint.as_deref())?;
                if !endpoint.enabled {
                    return Ok(format!("{} is disabled, enable it first", endpoint.name));
                }
                info!("Reconnect requested for {}", endpoint.name);
                self.manager.restart(&endpoint.id).await?;
                Ok(format!("Reconnecting {}", endpoint.name))
            }
            Command::Disconnect { endpoint } => {
                let endpoint = self.resolve(endpoint.as_deref())?;
                info!("Disconnect requested for {}", endpoint.name);
                self.manager.deactivate(&endpoint.id).await;
                Ok(format!(
                    "Disconnected {} until reconnect or restart",
                    endpoint.name
                ))
            }
            Command::Enable { endpoint } => {
                let endpoint = self.resolve(endpoint.as_deref())?;
                if endpoint.enabled {
                    // Already enabled; bring it back if it was disconnected
                    self.manager.activate(&endpoint.id)?;
                } else {
                    self.registry.set_enabled(&endpoint.id, true);
                    self.persist()?;
                }
                Ok(format!("Enabled {}", endpoint.name))
            }
            Command::Disable { endpoint } => {
                let endpoint = self.resolve(endpoint.as_deref())?;
                if endpoint.enabled {
                    self.registry.set_enabled(&endpoint.id, false);
                    self.persist()?;
                }
                // Stop right away instead of waiting for the reconciler
                self.manager.deactivate(&endpoint.id).await;
                Ok(format!("Disabled {}", endpoint.name))
            }
        }
    }

    async fn change_port(&self, endpoint: &Endpoint, port: u16) -> Result<String, CommandError> {
        let snapshot = self.registry.snapshot();
        if let Some(other) = snapshot.port_claimed_by(&endpoint.address, port, &endpoint.id) {
            return Err(ConnectionError::ConfigurationConflict {
                port,
                other: other.name.clone(),
            }
            .into());
        }

        let old = endpoint.port();
        self.registry.set_port(&endpoint.id, port);
        self.persist()?;
        info!("{} port changed from {} to {}", endpoint.name, old, port);

        if endpoint.enabled {
            self.manager.restart(&endpoint.id).await?;
        }
        Ok(format!("{} now uses port {} (was {})", endpoint.name, port, old))
    }

    fn persist(&self) -> Result<(), CommandError> {
        self.store.save(self.registry.snapshot().endpoints())?;
        Ok(())
    }

    /// Look an endpoint up by id or name; optional when exactly one exists.
    fn resolve(&self, reference: Option<&str>) -> Result<Endpoint, CommandError> {
        let snapshot = self.registry.snapshot();
        match reference {
            Some(reference) => snapshot
                .find(reference)
                .cloned()
                .ok_or_else(|| CommandError::UnknownEndpoint(reference.to_string())),
            None => match snapshot.endpoints() {
                [only] => Ok(only.clone()),
                [] => Err(CommandError::UnknownEndpoint("(none configured)".to_string())),
                many => Err(CommandError::AmbiguousEndpoint(
                    many.iter().map(|e| e.name.as_str()).collect::<Vec<_>>().join(", "),
                )),
            },
        }
    }

    /// One line per endpoint.
    pub fn status_text(&self) -> String {
        let status = self.manager.status();
        if status.is_empty() {
            return "No endpoints configured".to_string();
        }

        status
            .iter()
            .map(|(endpoint, info)| {
                let address = match &endpoint.address {
                    EndpointAddress::Listen { port } => format!("listen :{}", port),
                    EndpointAddress::Connect { host, port } => format!("connect {}:{}", host, port),
                };
                let mut line = format!("{} ({}, channel {})", endpoint.name, address, endpoint.channel);

                if !endpoint.enabled {
                    line.push_str(": disabled");
                    return line;
                }
                line.push_str(&format!(": {}", info.state));
                if info.state == ConnectionState::Connected {
                    line.push_str(&format!(", {} peer(s)", info.peers));
                }
                if let Some(name) = &info.peer_name {
                    line.push_str(&format!(", remote {}", name));
                }
                if info.retry_count > 0 {
                    line.push_str(&format!(", {} failed attempt(s)", info.retry_count));
                }
                if let Some(error) = &info.last_error {
                    line.push_str(&format!(", last error: {}", error));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
