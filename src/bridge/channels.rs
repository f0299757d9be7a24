//! Channels connecting transports, adapters and the relay.

use tokio::sync::{mpsc, watch};

use crate::common::messages::InboundEvent;
use crate::transport::status::ConnectionEvent;

/// Observations flowing into the relay worker pool.
pub struct InboundChannels {
    /// Cloned into every transport and local adapter.
    pub inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    /// Shared by the relay workers.
    pub inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Connection change notifications for status consumers.
pub struct StatusChannels {
    pub events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pub events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// The local display name announced to peers, once the adapter knows it.
pub struct IdentityChannels {
    pub identity_tx: watch::Sender<Option<String>>,
    pub identity_rx: watch::Receiver<Option<String>>,
}

/// Bundle of all channels the relay process needs.
pub struct ChannelBundle {
    pub inbound: InboundChannels,
    pub status: StatusChannels,
    pub identity: IdentityChannels,
}

impl ChannelBundle {
    /// Create the channel set, seeding the identity with `identity` when configured.
    pub fn new(identity: Option<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (identity_tx, identity_rx) = watch::channel(identity);

        Self {
            inbound: InboundChannels {
                inbound_tx,
                inbound_rx,
            },
            status: StatusChannels {
                events_tx,
                events_rx,
            },
            identity: IdentityChannels {
                identity_tx,
                identity_rx,
            },
        }
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new(None)
    }
}
