//! WebSocket transport: one listener or dialer task per active endpoint.

pub mod dialer;
pub mod listener;
pub mod manager;
pub mod session;
pub mod status;

use tokio::sync::oneshot;

use crate::common::error::SendError;
use crate::protocol::frames::Frame;

pub use manager::{ConnectionManager, DeactivateHook};
pub use status::{ConnectionEvent, ConnectionInfo, StatusBoard};

/// A frame handed to an endpoint task, with the channel its send result goes back on.
pub type Outbound = (Frame, oneshot::Sender<Result<(), SendError>>);
