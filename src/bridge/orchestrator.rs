//! Relay orchestrator that ties transports and local surfaces together.
//!
//! Every observation runs through the same pipeline: duplicate/echo check,
//! route, render per destination, enqueue. Delivery registers the echo record
//! before handing text to the destination.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::dedup::{DedupEngine, Verdict};
use crate::bridge::formatter::Renderer;
use crate::bridge::queue::{Deliver, DeliveryQueue};
use crate::bridge::registry::EndpointRegistry;
use crate::bridge::router::MessageRouter;
use crate::bridge::sink::Sinks;
use crate::common::error::SendError;
use crate::common::messages::{InboundEvent, Outgoing, RelayMessage};
use crate::common::types::{Role, Site};
use crate::config::types::Config;
use crate::protocol::frames::Frame;
use crate::transport::ConnectionManager;

/// Interval between dedup table purges.
const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Worker index an origin site is pinned to.
fn lane_for(site: &Site, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    site.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Performs the send for one queued entry.
pub struct Dispatcher {
    role: Role,
    dedup: Arc<DedupEngine>,
    manager: ConnectionManager,
    sinks: Sinks,
}

#[async_trait]
impl Deliver for Dispatcher {
    async fn deliver(&self, site: &Site, item: &Outgoing) -> Result<(), SendError> {
        // Must be in place before the destination can observe the text
        self.dedup.register_echo(site, &item.text);

        match site {
            Site::Endpoint(id) => {
                let frame = match self.role {
                    Role::Platform => Frame::DiscordMessage {
                        author: item.author.clone(),
                        content: item.text.clone(),
                        message_id: item.origin_id.clone(),
                    },
                    Role::Game => Frame::MinecraftMessage {
                        author: item.author.clone(),
                        content: item.text.clone(),
                    },
                };
                self.manager.send(id, frame).await
            }
            Site::Channel(channel) => {
                let sink = self
                    .sinks
                    .platform
                    .as_ref()
                    .ok_or_else(|| SendError::NoSink(site.to_string()))?;
                let message_id = sink.send(*channel, &item.text).await?;
                // The platform will hand our own post back to us
                self.dedup.record_seen(site, &message_id);
                Ok(())
            }
            Site::Game => {
                let sink = self
                    .sinks
                    .game
                    .as_ref()
                    .ok_or_else(|| SendError::NoSink(site.to_string()))?;
                sink.send_chat_or_command(&item.text).await
            }
        }
    }
}

/// The relay core.
pub struct Relay {
    registry: EndpointRegistry,
    router: MessageRouter,
    dedup: Arc<DedupEngine>,
    renderer: Renderer,
    queue: DeliveryQueue<Dispatcher>,
}

impl Relay {
    /// Create a relay delivering through `manager` and `sinks`.
    ///
    /// Deactivating an endpoint discards whatever is still queued for it.
    pub fn new(config: &Config, registry: EndpointRegistry, manager: ConnectionManager, sinks: Sinks) -> Self {
        let role = config.role();
        let dedup = Arc::new(DedupEngine::new(&config.dedup));
        let queue = DeliveryQueue::new(Dispatcher {
            role,
            dedup: Arc::clone(&dedup),
            manager: manager.clone(),
            sinks,
        });

        let discard = queue.discarder();
        manager.on_deactivate(Arc::new(move |id| {
            discard(&Site::Endpoint(id.clone()));
        }));

        Self {
            registry,
            router: MessageRouter::new(role),
            dedup,
            renderer: Renderer::new(role, &config.formats),
            queue,
        }
    }

    pub fn queue(&self) -> &DeliveryQueue<Dispatcher> {
        &self.queue
    }

    /// Handle one observation. Returns how many deliveries were queued.
    pub fn process(&self, event: InboundEvent) -> usize {
        let site = event.site.clone();
        let from_self = event.from_self;
        let message = RelayMessage::from(event);

        let verdict = self.dedup.check_inbound(&site, &message);
        if verdict != Verdict::Accept {
            debug!("Suppressed inbound message from {}: {:?}", site, verdict);
            return 0;
        }
        // Our own output only feeds the dedup tables
        if from_self {
            return 0;
        }

        let snapshot = self.registry.snapshot();
        let route = self.router.route(&snapshot, &message);
        if route.is_empty() {
            return 0;
        }

        let mut queued = 0;
        for destination in &route.destinations {
            for item in self.renderer.render(&route, &message, destination) {
                self.queue.enqueue(destination.clone(), item);
                queued += 1;
            }
        }

        info!(
            "Relayed from {} to {} destination(s): {}: {}",
            site,
            route.destinations.len(),
            message.author(),
            message.content()
        );
        queued
    }

    /// Start `count` workers fed from the inbound channel.
    ///
    /// Every origin site is pinned to one worker, so observations from one
    /// site are accepted and enqueued in arrival order.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let (lanes, receivers): (Vec<_>, Vec<_>) = (0..count.max(1))
            .map(|_| mpsc::unbounded_channel::<InboundEvent>())
            .unzip();

        let mut tasks: Vec<JoinHandle<()>> = receivers
            .into_iter()
            .enumerate()
            .map(|(worker, mut lane)| {
                let relay = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(event) = lane.recv().await {
                        relay.process(event);
                    }
                    debug!("Relay worker {} stopped", worker);
                })
            })
            .collect();

        // Workers stop once the distributor drops their lanes
        tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = inbound.recv() => event,
                };
                let Some(event) = event else { break };
                let lane = &lanes[lane_for(&event.site, lanes.len())];
                if lane.send(event).is_err() {
                    break;
                }
            }
            debug!("Relay distributor stopped");
        }));
        tasks
    }

    /// Purge expired dedup entries periodically.
    pub fn spawn_janitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let dedup = Arc::clone(&self.dedup);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let purged = dedup.purge_expired();
                        if purged > 0 {
                            debug!("Purged {} expired dedup entries", purged);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::{SinkExt, StreamExt};
    use tokio::sync::watch;
    use tokio_tungstenite::tungstenite::Message;

    use crate::bridge::registry::tests::make_endpoint;
    use crate::bridge::registry::{Endpoint, EndpointAddress};
    use crate::bridge::sink::{GameSink, PlatformSink};
    use crate::common::reconnect::ConnectionPolicy;
    use crate::common::types::{ChannelId, ConnectionState, EndpointId};
    use crate::config::parser::load_config_str;

    #[derive(Default)]
    struct FakePlatform {
        posts: Mutex<Vec<(ChannelId, String)>>,
    }

    impl FakePlatform {
        fn texts(&self) -> Vec<String> {
            self.posts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl PlatformSink for FakePlatform {
        async fn send(&self, channel: ChannelId, text: &str) -> Result<String, SendError> {
            let mut posts = self.posts.lock().unwrap();
            posts.push((channel, text.to_string()));
            Ok(format!("posted-{}", posts.len()))
        }
    }

    /// Behaves like the game: injected chat shows up again in the chat log.
    struct FakeGame {
        said: Mutex<Vec<String>>,
        display: mpsc::UnboundedSender<InboundEvent>,
    }

    #[async_trait]
    impl GameSink for FakeGame {
        async fn send_chat_or_command(&self, text: &str) -> Result<(), SendError> {
            self.said.lock().unwrap().push(text.to_string());
            let _ = self
                .display
                .send(InboundEvent::new(Site::Game, "Steve", format!("<Steve> {}", text)).from_self(true));
            Ok(())
        }

        async fn show_notice(&self, _text: &str) {}
    }

    fn config(role: &str) -> Config {
        load_config_str(&format!(
            r#"
            relay {{ role = "{}" }}
            discord {{ token = "test" }}
            "#,
            role
        ))
        .unwrap()
    }

    fn manager(registry: &EndpointRegistry, role: Role, inbound_tx: mpsc::UnboundedSender<InboundEvent>) -> ConnectionManager {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_identity_tx, identity_rx) = watch::channel(Some("Steve".to_string()));
        ConnectionManager::new(
            registry.clone(),
            role,
            ConnectionPolicy::default(),
            inbound_tx,
            events_tx,
            identity_rx,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_relays_endpoint_chat_to_channel_once() {
        let registry = EndpointRegistry::new(vec![make_endpoint("a", 7, 25580)]);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let platform = Arc::new(FakePlatform::default());
        let relay = Relay::new(
            &config("platform"),
            registry.clone(),
            manager(&registry, Role::Platform, inbound_tx),
            Sinks::platform(platform.clone()),
        );

        let chat = InboundEvent::new(Site::Endpoint("a".into()), "Steve", "hi *all*");
        assert_eq!(relay.process(chat), 1);
        settle().await;
        assert_eq!(platform.texts(), vec![r"Steve: hi \*all\*"]);

        // The bot sees its own post come back with the id it was given
        let own = InboundEvent::new(Site::Channel(ChannelId(7)), "Bridge", r"Steve: hi \*all\*")
            .with_origin_id(Some("posted-1".to_string()))
            .from_self(true);
        assert_eq!(relay.process(own), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_channel_tags_and_mirrors() {
        let registry = EndpointRegistry::new(vec![
            make_endpoint("a", 7, 25580),
            make_endpoint("b", 7, 25590),
        ]);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let platform = Arc::new(FakePlatform::default());
        let relay = Relay::new(
            &config("platform"),
            registry.clone(),
            manager(&registry, Role::Platform, inbound_tx),
            Sinks::platform(platform.clone()),
        );

        // Channel post plus a mirror towards the sibling endpoint
        let chat = InboundEvent::new(Site::Endpoint("a".into()), "Steve", "hello");
        assert_eq!(relay.process(chat), 2);
        settle().await;
        assert_eq!(platform.texts(), vec!["[A] Steve: hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_origin_id_is_forwarded_once() {
        let registry = EndpointRegistry::new(vec![make_endpoint("a", 7, 25580)]);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let platform = Arc::new(FakePlatform::default());
        let relay = Relay::new(
            &config("platform"),
            registry.clone(),
            manager(&registry, Role::Platform, inbound_tx),
            Sinks::platform(platform.clone()),
        );

        for _ in 0..2 {
            let chat = InboundEvent::new(Site::Endpoint("a".into()), "Steve", "once")
                .with_origin_id(Some("m1".to_string()));
            relay.process(chat);
        }
        settle().await;
        assert_eq!(platform.texts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_message_is_dropped() {
        let mut endpoint = make_endpoint("a", 7, 25580);
        endpoint.enabled = false;
        let registry = EndpointRegistry::new(vec![endpoint]);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let relay = Relay::new(
            &config("platform"),
            registry.clone(),
            manager(&registry, Role::Platform, inbound_tx),
            Sinks::default(),
        );

        let chat = InboundEvent::new(Site::Endpoint("a".into()), "Steve", "lost");
        assert_eq!(relay.process(chat), 0);
    }

    fn listen_endpoint(port: u16) -> Endpoint {
        Endpoint {
            id: "srv".into(),
            name: "Survival".to_string(),
            address: EndpointAddress::Listen { port },
            channel: ChannelId(7),
            enabled: true,
            forward: true,
        }
    }

    #[tokio::test]
    async fn test_game_injection_does_not_echo_back() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let registry = EndpointRegistry::new(vec![listen_endpoint(port)]);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let game = Arc::new(FakeGame {
            said: Mutex::new(Vec::new()),
            display: inbound_tx.clone(),
        });
        let manager = manager(&registry, Role::Game, inbound_tx.clone());
        let relay = Arc::new(Relay::new(
            &config("game"),
            registry.clone(),
            manager.clone(),
            Sinks::game(game.clone()),
        ));
        let cancel = CancellationToken::new();
        relay.spawn_workers(2, inbound_rx, cancel.clone());

        let id = EndpointId::from("srv");
        manager.activate(&id).unwrap();
        for _ in 0..100 {
            if manager.info(&id).state == ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}", port))
            .await
            .unwrap();
        // connection_status
        ws.next().await.unwrap().unwrap();

        ws.send(Message::Text(
            r#"{"type":"discord_message","author":"Alex","content":"[Alex] hello","messageId":"9"}"#
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        settle().await;
        assert_eq!(*game.said.lock().unwrap(), vec!["[Alex] hello"]);

        // The displayed injection must not travel back to the bot
        let echoed = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
        assert!(echoed.is_err());

        // Genuine player chat still goes out
        inbound_tx
            .send(InboundEvent::new(Site::Game, "Steve", "gg"))
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "minecraft_message");
        assert_eq!(value["author"], "Steve");
        assert_eq!(value["content"], "gg");

        cancel.cancel();
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_discards_pending_deliveries() {
        let registry = EndpointRegistry::new(vec![make_endpoint("a", 7, 25580)]);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let manager = manager(&registry, Role::Platform, inbound_tx);
        let relay = Relay::new(&config("platform"), registry.clone(), manager.clone(), Sinks::default());

        let site = Site::Endpoint("a".into());
        for text in ["one", "two", "three"] {
            relay.queue().enqueue(site.clone(), Outgoing::new("x", text));
        }
        manager.deactivate(&"a".into()).await;
        assert_eq!(relay.queue().pending(&site), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_read_back_of_injection_is_not_relayed() {
        let registry = EndpointRegistry::new(vec![make_endpoint("a", 7, 25580)]);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let platform = Arc::new(FakePlatform::default());
        let relay = Relay::new(
            &config("platform"),
            registry.clone(),
            manager(&registry, Role::Platform, inbound_tx),
            Sinks::platform(platform.clone()),
        );

        // Channel chat is injected into the game behind endpoint "a"
        let chat = InboundEvent::new(Site::Channel(ChannelId(7)), "Alex", "hello")
            .with_origin_id(Some("d1".to_string()));
        assert_eq!(relay.process(chat), 1);
        settle().await;

        // The game shows the injection in its chat log and the mod reports it
        let read_back = InboundEvent::new(Site::Endpoint("a".into()), "Bot", "<Bot> [Alex] hello");
        assert_eq!(relay.process(read_back), 0);
        settle().await;
        assert!(platform.texts().is_empty());

        // Genuine chat from the same endpoint still reaches the channel
        let genuine = InboundEvent::new(Site::Endpoint("a".into()), "Steve", "hello back");
        assert_eq!(relay.process(genuine), 1);
        settle().await;
        assert_eq!(platform.texts(), vec!["Steve: hello back"]);
    }

    #[test]
    fn test_site_is_pinned_to_one_lane() {
        let site = Site::Endpoint("a".into());
        let lane = lane_for(&site, 2);
        assert!(lane < 2);
        for _ in 0..10 {
            assert_eq!(lane_for(&site, 2), lane);
        }
        assert_eq!(lane_for(&Site::Game, 1), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_keeps_per_site_order() {
        const COUNT: usize = 3000;

        let registry = EndpointRegistry::new(vec![make_endpoint("a", 7, 25580)]);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let platform = Arc::new(FakePlatform::default());
        let relay = Arc::new(Relay::new(
            &config("platform"),
            registry.clone(),
            manager(&registry, Role::Platform, inbound_tx.clone()),
            Sinks::platform(platform.clone()),
        ));
        let cancel = CancellationToken::new();
        let tasks = relay.spawn_workers(2, inbound_rx, cancel.clone());
        assert_eq!(tasks.len(), 3);

        for i in 0..COUNT {
            inbound_tx
                .send(InboundEvent::new(Site::Endpoint("a".into()), "Steve", format!("m{}", i)))
                .unwrap();
        }
        for _ in 0..500 {
            if platform.texts().len() == COUNT {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let expected: Vec<String> = (0..COUNT).map(|i| format!("Steve: m{}", i)).collect();
        assert_eq!(platform.texts(), expected);
        cancel.cancel();
    }
}
