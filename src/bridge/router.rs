//! Destination resolution.
//!
//! Maps an accepted message to the sites it must be delivered to, given the
//! process role and the current registry snapshot, and decides whether the
//! rendered text is tagged with the origin endpoint's name.

use tracing::debug;

use crate::bridge::registry::RegistrySnapshot;
use crate::common::messages::RelayMessage;
use crate::common::types::{EndpointId, Role, Site};

/// Where a message goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub destinations: Vec<Site>,
    /// Origin endpoint name to prefix onto platform-bound text.
    pub tag: Option<String>,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// The endpoint destinations only.
    pub fn endpoint_destinations(&self) -> Vec<EndpointId> {
        self.destinations
            .iter()
            .filter_map(|site| match site {
                Site::Endpoint(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Role-aware message router.
#[derive(Debug, Clone, Copy)]
pub struct MessageRouter {
    role: Role,
}

impl MessageRouter {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Resolve destinations for `message`. The origin is never among them.
    pub fn route(&self, snapshot: &RegistrySnapshot, message: &RelayMessage) -> Route {
        let route = match (self.role, message.origin()) {
            (Role::Platform, Site::Endpoint(id)) => Self::from_game_endpoint(snapshot, id),
            (Role::Platform, Site::Channel(channel)) => Route {
                destinations: snapshot
                    .enabled_on_channel(*channel)
                    .map(|e| Site::Endpoint(e.id.clone()))
                    .collect(),
                tag: None,
            },
            (Role::Game, Site::Game) => Route {
                destinations: snapshot
                    .endpoints()
                    .iter()
                    .filter(|e| e.enabled && e.forward)
                    .map(|e| Site::Endpoint(e.id.clone()))
                    .collect(),
                tag: None,
            },
            (Role::Game, Site::Endpoint(id)) => match snapshot.get(id) {
                Some(endpoint) if endpoint.enabled => Route {
                    destinations: vec![Site::Game],
                    tag: None,
                },
                _ => Route::default(),
            },
            _ => Route::default(),
        };

        if route.is_empty() {
            debug!("Unroutable message from {} dropped", message.origin());
        }
        route
    }

    /// Game chat arriving at the platform: post to the endpoint's channel and
    /// mirror to sibling endpoints sharing it.
    fn from_game_endpoint(snapshot: &RegistrySnapshot, id: &EndpointId) -> Route {
        let Some(origin) = snapshot.get(id).filter(|e| e.enabled) else {
            return Route::default();
        };

        let mut destinations = Vec::new();
        if origin.forward {
            destinations.push(Site::Channel(origin.channel));
        }
        destinations.extend(
            snapshot
                .enabled_on_channel(origin.channel)
                .filter(|e| e.id != origin.id)
                .map(|e| Site::Endpoint(e.id.clone())),
        );

        let tag = (snapshot.forwarding_on_channel(origin.channel) > 1).then(|| origin.name.clone());
        Route { destinations, tag }
    }
}
