//! Discord bot integration.
//!
//! This module provides the platform side: the bot client, the message
//! handler feeding the relay and the sink posting relayed text.

pub mod client;
pub mod handler;
pub mod sink;

// Re-export main types for external use
pub use client::DiscordBot;
pub use handler::BridgeHandler;
pub use sink::DiscordSink;
