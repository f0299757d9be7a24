//! Consumer of connection change notifications.
//!
//! Logs state changes, persists ports the dialer negotiated and, in the game
//! role, tells the player when the platform side comes and goes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::registry::EndpointRegistry;
use crate::bridge::sink::GameSink;
use crate::common::types::EndpointId;
use crate::config::store::EndpointStore;
use crate::transport::status::ConnectionEvent;

pub const NOTICE_CONNECTED: &str = "[Discord] Connected to Discord chat bridge";
pub const NOTICE_DISCONNECTED: &str = "[Discord] Disconnected from Discord chat bridge";

pub struct StatusMonitor {
    registry: EndpointRegistry,
    store: Arc<dyn EndpointStore>,
    game: Option<Arc<dyn GameSink>>,
    peers: HashMap<EndpointId, usize>,
}

impl StatusMonitor {
    pub fn new(registry: EndpointRegistry, store: Arc<dyn EndpointStore>, game: Option<Arc<dyn GameSink>>) -> Self {
        Self {
            registry,
            store,
            game,
            peers: HashMap::new(),
        }
    }

    fn total_peers(&self) -> usize {
        self.peers.values().sum()
    }

    async fn notify(&self, text: &str) {
        if let Some(game) = &self.game {
            game.show_notice(text).await;
        }
    }

    pub async fn handle(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { endpoint, state } => {
                info!("Endpoint {} is now {}", endpoint, state);
            }
            ConnectionEvent::PeersChanged { endpoint, peers } => {
                debug!("Endpoint {} has {} peer(s)", endpoint, peers);
                let before = self.total_peers();
                self.peers.insert(endpoint, peers);
                let after = self.total_peers();
                if before == 0 && after > 0 {
                    self.notify(NOTICE_CONNECTED).await;
                } else if before > 0 && after == 0 {
                    self.notify(NOTICE_DISCONNECTED).await;
                }
            }
            ConnectionEvent::ConfigUpdated { endpoint, port } => {
                info!("Persisting port {} for endpoint {}", port, endpoint);
                if let Err(e) = self.store.save(self.registry.snapshot().endpoints()) {
                    warn!("Failed to persist endpoints: {}", e);
                }
            }
            ConnectionEvent::PeerIdentity { endpoint, name } => {
                info!("Endpoint {} peer is {}", endpoint, name);
            }
            ConnectionEvent::Failed { endpoint, error } => {
                error!("Endpoint {} failed: {}", endpoint, error);
                self.notify(&format!("[Discord] {}", error)).await;
            }
        }
    }

    /// Consume events until cancelled or the channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event).await,
                None => break,
            }
        }
    }
}
