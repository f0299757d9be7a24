//! Game side: chat event translation and the console game adapter.

pub mod chat;
pub mod console;

pub use chat::GameEvent;
pub use console::{run_console, ConsoleGame};
