//! Canonical message types for relay communication.
//!
//! Every observation entering the relay, from either chat surface, becomes an
//! `InboundEvent`; the worker pool turns it into an immutable `RelayMessage`.

use tokio::time::Instant;

use crate::common::types::{EndpointId, Site};

/// An observation handed to the relay by a transport or a local adapter.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Where the observation came from.
    pub site: Site,
    /// Author display name (`"System"` for non-player text).
    pub author: String,
    /// Message text as observed.
    pub content: String,
    /// Identifier assigned by the origin platform, when it has one.
    pub origin_id: Option<String>,
    /// Observation was authored by this process itself (e.g. the bot's own post).
    pub from_self: bool,
    /// When the observation was made.
    pub received_at: Instant,
}

impl InboundEvent {
    pub fn new(site: Site, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            site,
            author: author.into(),
            content: content.into(),
            origin_id: None,
            from_self: false,
            received_at: Instant::now(),
        }
    }

    /// Attach the origin platform's message identifier.
    pub fn with_origin_id(mut self, origin_id: Option<String>) -> Self {
        self.origin_id = origin_id.filter(|id| !id.is_empty());
        self
    }

    /// Mark the observation as authored by this process.
    pub fn from_self(mut self, from_self: bool) -> Self {
        self.from_self = from_self;
        self
    }
}

/// A message accepted for relaying. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    origin: Site,
    author: String,
    content: String,
    origin_id: Option<String>,
    received_at: Instant,
}

impl RelayMessage {
    pub fn new(
        origin: Site,
        author: impl Into<String>,
        content: impl Into<String>,
        origin_id: Option<String>,
        received_at: Instant,
    ) -> Self {
        Self {
            origin,
            author: author.into(),
            content: content.into(),
            origin_id,
            received_at,
        }
    }

    pub fn origin(&self) -> &Site {
        &self.origin
    }

    /// Origin endpoint, when the message came in over a bridge endpoint.
    pub fn origin_endpoint(&self) -> Option<&EndpointId> {
        match &self.origin {
            Site::Endpoint(id) => Some(id),
            _ => None,
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn origin_id(&self) -> Option<&str> {
        self.origin_id.as_deref()
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

impl From<InboundEvent> for RelayMessage {
    fn from(event: InboundEvent) -> Self {
        RelayMessage::new(
            event.site,
            event.author,
            event.content,
            event.origin_id,
            event.received_at,
        )
    }
}

/// A rendered message waiting in a delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Author carried in the wire frame (endpoint destinations).
    pub author: String,
    /// Final text for this destination; also the echo fingerprint source.
    pub text: String,
    /// Origin message id carried along to endpoint destinations.
    pub origin_id: Option<String>,
}

impl Outgoing {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
            origin_id: None,
        }
    }

    pub fn with_origin_id(mut self, origin_id: Option<String>) -> Self {
        self.origin_id = origin_id;
        self
    }
}
