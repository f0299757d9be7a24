//! Wire protocol spoken over bridge endpoints.

pub mod frames;

pub use frames::{decode, encode, ConnectionStatus, Frame};
