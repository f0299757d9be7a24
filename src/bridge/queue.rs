//! Per-destination ordered delivery.
//!
//! One FIFO per destination site with at most one drain worker. The worker
//! awaits each send before popping the next entry, so a destination never
//! sees B before A. Failed sends are logged and dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::common::error::SendError;
use crate::common::messages::Outgoing;
use crate::common::types::Site;

/// Performs the actual send for one queued entry.
#[async_trait]
pub trait Deliver: Send + Sync + 'static {
    async fn deliver(&self, site: &Site, item: &Outgoing) -> Result<(), SendError>;
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<Site, VecDeque<Outgoing>>,
    draining: HashSet<Site>,
}

struct QueueInner<D> {
    deliver: D,
    state: Mutex<QueueState>,
}

/// Delivery queues keyed by destination.
pub struct DeliveryQueue<D: Deliver> {
    inner: Arc<QueueInner<D>>,
}

impl<D: Deliver> Clone for DeliveryQueue<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Deliver> DeliveryQueue<D> {
    pub fn new(deliver: D) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                deliver,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn deliverer(&self) -> &D {
        &self.inner.deliver
    }

    /// Append `item` for `site`, starting a drain worker if none is running.
    pub fn enqueue(&self, site: Site, item: Outgoing) {
        let start = {
            let mut state = self.inner.lock();
            state.pending.entry(site.clone()).or_default().push_back(item);
            state.draining.insert(site.clone())
        };

        if start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.drain(site).await });
        }
    }

    /// Drop everything pending for `site`. Returns how many entries were dropped.
    pub fn discard(&self, site: &Site) -> usize {
        self.inner.discard(site)
    }

    /// A discard callback that does not keep the queue alive.
    pub fn discarder(&self) -> impl Fn(&Site) -> usize + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move |site| inner.upgrade().map_or(0, |inner| inner.discard(site))
    }

    /// Entries waiting for `site`, not counting one in flight.
    pub fn pending(&self, site: &Site) -> usize {
        self.inner
            .lock()
            .pending
            .get(site)
            .map_or(0, VecDeque::len)
    }
}

impl<D: Deliver> QueueInner<D> {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discard(&self, site: &Site) -> usize {
        let dropped = self
            .lock()
            .pending
            .remove(site)
            .map_or(0, |queue| queue.len());
        if dropped > 0 {
            debug!("Discarded {} pending deliveries for {}", dropped, site);
        }
        dropped
    }

    fn pop(&self, site: &Site) -> Option<Outgoing> {
        let mut state = self.lock();
        let next = state.pending.get_mut(site).and_then(VecDeque::pop_front);
        if next.is_none() {
            state.pending.remove(site);
            state.draining.remove(site);
        }
        next
    }

    async fn drain(&self, site: Site) {
        while let Some(item) = self.pop(&site) {
            match self.deliver.deliver(&site, &item).await {
                Ok(()) => {}
                Err(e @ SendError::NotConnected(_)) => {
                    debug!("Dropped message for {}: {}", site, e)
                }
                Err(e) => warn!("Failed to deliver message to {}: {}", site, e),
            }
        }
    }
}
