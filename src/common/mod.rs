//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod reconnect;
pub mod types;

pub use messages::{InboundEvent, Outgoing, RelayMessage};
pub use types::{ChannelId, ConnectionState, EndpointId, Role, Site, SYSTEM_AUTHOR};
