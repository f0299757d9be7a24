//! Endpoint registry.
//!
//! Holds the configured bridge endpoints. Readers take an `Arc` snapshot and
//! never observe a half-applied change: every mutation builds a complete new
//! snapshot and publishes it through a `watch` channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::common::types::{ChannelId, EndpointId};
use crate::config::types::EndpointConfig;

/// Where an endpoint's transport lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EndpointAddress {
    /// Bind a local port and accept peers.
    Listen { port: u16 },
    /// Dial a remote WebSocket server.
    Connect { host: String, port: u16 },
}

impl EndpointAddress {
    pub fn port(&self) -> u16 {
        match self {
            EndpointAddress::Listen { port } | EndpointAddress::Connect { port, .. } => *port,
        }
    }

    /// Same address with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            EndpointAddress::Listen { .. } => EndpointAddress::Listen { port },
            EndpointAddress::Connect { host, .. } => EndpointAddress::Connect {
                host: host.clone(),
                port,
            },
        }
    }

    /// Whether this address moved to `port` would compete with `other` for a socket.
    pub(crate) fn collides_at(&self, port: u16, other: &EndpointAddress) -> bool {
        match (self, other) {
            (EndpointAddress::Listen { .. }, EndpointAddress::Listen { port: taken }) => *taken == port,
            (
                EndpointAddress::Connect { host: a, .. },
                EndpointAddress::Connect { host: b, port: taken },
            ) => *taken == port && a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

/// One configured bridge endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    #[serde(flatten)]
    pub address: EndpointAddress,
    pub channel: ChannelId,
    pub enabled: bool,
    /// Game chat arriving here is forwarded to the platform channel.
    pub forward: bool,
}

impl Endpoint {
    /// Build an endpoint from its configuration with a fresh id.
    ///
    /// Returns `None` for an unknown mode; validation rejects those earlier.
    pub fn from_config(config: &EndpointConfig) -> Option<Self> {
        let address = match config.mode.to_lowercase().as_str() {
            "listen" => EndpointAddress::Listen { port: config.port },
            "connect" => EndpointAddress::Connect {
                host: config.host.clone()?,
                port: config.port,
            },
            _ => return None,
        };

        Some(Self {
            id: EndpointId::generate(),
            name: config.name.clone(),
            address,
            channel: ChannelId(config.channel),
            enabled: config.enabled,
            forward: config.forward,
        })
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

/// An immutable view of the registry at one point in time.
#[derive(Debug, Default, Clone)]
pub struct RegistrySnapshot {
    endpoints: Vec<Endpoint>,
}

impl RegistrySnapshot {
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| &e.id == id)
    }

    /// Look up by id or by case-insensitive display name.
    pub fn find(&self, reference: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.id.as_str() == reference)
            .or_else(|| {
                self.endpoints
                    .iter()
                    .find(|e| e.name.eq_ignore_ascii_case(reference))
            })
    }

    /// Enabled endpoints mapped to `channel`.
    pub fn enabled_on_channel(&self, channel: ChannelId) -> impl Iterator<Item = &Endpoint> {
        self.endpoints
            .iter()
            .filter(move |e| e.enabled && e.channel == channel)
    }

    /// Number of enabled, forward-enabled endpoints mapped to `channel`.
    pub fn forwarding_on_channel(&self, channel: ChannelId) -> usize {
        self.enabled_on_channel(channel).filter(|e| e.forward).count()
    }

    /// A sibling of `except` whose address would collide with `address` moved to `port`.
    pub fn port_claimed_by(
        &self,
        address: &EndpointAddress,
        port: u16,
        except: &EndpointId,
    ) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| &e.id != except)
            .find(|e| address.collides_at(port, &e.address))
    }
}

/// Shared, cloneable handle to the endpoint set.
#[derive(Clone)]
pub struct EndpointRegistry {
    tx: Arc<watch::Sender<Arc<RegistrySnapshot>>>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(RegistrySnapshot { endpoints }));
        Self { tx: Arc::new(tx) }
    }

    /// Current complete snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.tx.borrow().clone()
    }

    /// Receive every newly published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.tx.subscribe()
    }

    /// Apply `f` to a copy of the endpoint list and publish the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<Endpoint>) -> R) -> R {
        let mut endpoints = self.snapshot().endpoints.clone();
        let result = f(&mut endpoints);
        self.tx.send_replace(Arc::new(RegistrySnapshot { endpoints }));
        result
    }

    /// Change an endpoint's port. Returns false for an unknown id.
    pub fn set_port(&self, id: &EndpointId, port: u16) -> bool {
        self.update(|endpoints| match endpoints.iter_mut().find(|e| &e.id == id) {
            Some(endpoint) => {
                endpoint.address = endpoint.address.with_port(port);
                true
            }
            None => false,
        })
    }

    /// Toggle an endpoint. Returns false for an unknown id.
    pub fn set_enabled(&self, id: &EndpointId, enabled: bool) -> bool {
        self.update(|endpoints| match endpoints.iter_mut().find(|e| &e.id == id) {
            Some(endpoint) => {
                endpoint.enabled = enabled;
                true
            }
            None => false,
        })
    }

    pub fn insert(&self, endpoint: Endpoint) {
        self.update(|endpoints| {
            endpoints.retain(|e| e.id != endpoint.id);
            endpoints.push(endpoint);
        });
    }

    pub fn remove(&self, id: &EndpointId) -> Option<Endpoint> {
        self.update(|endpoints| {
            let index = endpoints.iter().position(|e| &e.id == id)?;
            Some(endpoints.remove(index))
        })
    }
}
