//! Per-endpoint connection status and change notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::common::types::{ConnectionState, EndpointId};

/// Runtime view of one endpoint's connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// Connected peers (accepted sockets, or 1 for an established dial).
    pub peers: usize,
    /// Failed attempts since the last successful connect.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Last frame or liveness reply received.
    pub last_seen: Option<Instant>,
    /// Port actually bound or dialed.
    pub bound_port: Option<u16>,
    /// Display name announced by the far side.
    pub peer_name: Option<String>,
}

/// Change notifications for status displays. Never awaited by the data path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        endpoint: EndpointId,
        state: ConnectionState,
    },
    PeersChanged {
        endpoint: EndpointId,
        peers: usize,
    },
    /// The dialer settled on a different port; persist it.
    ConfigUpdated { endpoint: EndpointId, port: u16 },
    PeerIdentity { endpoint: EndpointId, name: String },
    /// A failure the operator has to act on.
    Failed { endpoint: EndpointId, error: String },
}

/// Shared table of [`ConnectionInfo`] plus the event sender.
#[derive(Clone)]
pub struct StatusBoard {
    entries: Arc<Mutex<HashMap<EndpointId, ConnectionInfo>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl StatusBoard {
    pub fn new(events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EndpointId, ConnectionInfo>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn get(&self, id: &EndpointId) -> ConnectionInfo {
        self.lock().get(id).cloned().unwrap_or_default()
    }

    pub fn state(&self, id: &EndpointId) -> ConnectionState {
        self.lock().get(id).map(|info| info.state).unwrap_or_default()
    }

    /// Mutate an entry in place.
    pub fn update(&self, id: &EndpointId, f: impl FnOnce(&mut ConnectionInfo)) {
        f(self.lock().entry(id.clone()).or_default());
    }

    pub fn set_state(&self, id: &EndpointId, state: ConnectionState) {
        let changed = {
            let mut entries = self.lock();
            let info = entries.entry(id.clone()).or_default();
            let changed = info.state != state;
            info.state = state;
            if state == ConnectionState::Connected {
                info.retry_count = 0;
                info.last_error = None;
            }
            changed
        };
        if changed {
            self.emit(ConnectionEvent::StateChanged {
                endpoint: id.clone(),
                state,
            });
        }
    }

    pub fn set_peers(&self, id: &EndpointId, peers: usize) {
        let changed = {
            let mut entries = self.lock();
            let info = entries.entry(id.clone()).or_default();
            let changed = info.peers != peers;
            info.peers = peers;
            changed
        };
        if changed {
            self.emit(ConnectionEvent::PeersChanged {
                endpoint: id.clone(),
                peers,
            });
        }
    }

    pub fn set_peer_name(&self, id: &EndpointId, name: &str) {
        self.update(id, |info| info.peer_name = Some(name.to_string()));
        self.emit(ConnectionEvent::PeerIdentity {
            endpoint: id.clone(),
            name: name.to_string(),
        });
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, id: &EndpointId, error: &str) {
        self.update(id, |info| {
            info.retry_count += 1;
            info.last_error = Some(error.to_string());
        });
    }

    pub fn touch(&self, id: &EndpointId) {
        self.update(id, |info| info.last_seen = Some(Instant::now()));
    }

    pub fn remove(&self, id: &EndpointId) {
        self.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_change_emits_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let board = StatusBoard::new(tx);
        let id = EndpointId::from("a");

        board.set_state(&id, ConnectionState::Connecting);
        board.set_state(&id, ConnectionState::Connecting);

        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::StateChanged {
                endpoint: id.clone(),
                state: ConnectionState::Connecting
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connected_resets_failures() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let board = StatusBoard::new(tx);
        let id = EndpointId::from("a");

        board.record_failure(&id, "refused");
        board.record_failure(&id, "refused");
        assert_eq!(board.get(&id).retry_count, 2);

        board.set_state(&id, ConnectionState::Connected);
        let info = board.get(&id);
        assert_eq!(info.retry_count, 0);
        assert!(info.last_error.is_none());
    }

    #[test]
    fn test_closed_receiver_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let board = StatusBoard::new(tx);
        board.set_peers(&EndpointId::from("a"), 3);
        assert_eq!(board.get(&EndpointId::from("a")).peers, 3);
    }
}
