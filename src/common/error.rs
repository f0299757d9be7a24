//! Error types for the application.
//!
//! Nothing on the data path returns these to a caller that could tear down a
//! connection; they are logged at the boundary where they occur.

use thiserror::Error;

use crate::common::types::EndpointId;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },

    #[error("Failed to write state file '{path}': {message}")]
    StoreError { path: String, message: String },
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Address-in-use at listen time. Surfaced to the operator, never retried.
    #[error("port {port} already in use, use the port command to pick another one")]
    BindConflict { port: u16 },

    /// Two endpoints claim the same port.
    #[error("port {port} is already claimed by endpoint '{other}'")]
    ConfigurationConflict { port: u16, other: String },

    #[error("Failed to connect to {host}:{port}: {message}")]
    ConnectFailed {
        host: String,
        port: u16,
        message: String,
    },

    #[error("WebSocket handshake with {host}:{port} failed: {message}")]
    Handshake {
        host: String,
        port: u16,
        message: String,
    },

    #[error("Gave up probing after {attempts} ports above {base}")]
    PortProbeExhausted { base: u16, attempts: u32 },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Whether a dial failure should make the dialer try the next port.
    ///
    /// Refused or reset connections qualify, and so does a port whose holder
    /// accepts TCP but does not complete a WebSocket handshake.
    pub fn is_probe_eligible(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectFailed { .. } | ConnectionError::Handshake { .. }
        )
    }
}

/// Failure delivering a single message. The message is dropped.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("platform send failed: {0}")]
    Platform(String),

    #[error("game sink failed: {0}")]
    Game(String),

    #[error("no sink configured for {0}")]
    NoSink(String),
}

/// Inbound payload that could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Operator command rejected.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Port must be between 1024 and 65535 (got {0})")]
    PortOutOfRange(i64),

    #[error("Not a port number: '{0}'")]
    InvalidPort(String),

    #[error("No endpoint named '{0}'")]
    UnknownEndpoint(String),

    #[error("Several endpoints configured, name one of: {0}")]
    AmbiguousEndpoint(String),

    #[error("Unknown command '{0}'. Try: status, port, reconnect, disconnect, enable, disable")]
    UnknownCommand(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_conflict_message_points_to_port_command() {
        let err = ConnectionError::BindConflict { port: 25580 };
        let text = err.to_string();
        assert!(text.contains("25580"));
        assert!(text.contains("port command"));
    }

    #[test]
    fn test_probe_eligibility() {
        let refused = ConnectionError::ConnectFailed {
            host: "127.0.0.1".to_string(),
            port: 25580,
            message: "Connection refused".to_string(),
        };
        assert!(refused.is_probe_eligible());
        assert!(!ConnectionError::BindConflict { port: 1 }.is_probe_eligible());
    }
}
