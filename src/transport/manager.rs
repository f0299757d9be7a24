//! Connection supervisor.
//!
//! Owns one transport task per active endpoint. `activate` starts a listener
//! or dialer, `deactivate` cancels it and waits for it to release its socket.
//! A reconciler follows registry snapshots so that enabling, disabling,
//! adding or removing an endpoint starts or stops its transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::registry::{Endpoint, EndpointAddress, EndpointRegistry, RegistrySnapshot};
use crate::common::error::{ConnectionError, ConnectionResult, SendError};
use crate::common::messages::InboundEvent;
use crate::common::reconnect::ConnectionPolicy;
use crate::common::types::{ConnectionState, EndpointId, Role};
use crate::protocol::frames::Frame;
use crate::transport::session::EndpointContext;
use crate::transport::status::{ConnectionEvent, ConnectionInfo, StatusBoard};
use crate::transport::{dialer, listener, Outbound};

/// Upper bound on waiting for one transport to stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Called with the endpoint id whenever an endpoint is deactivated.
pub type DeactivateHook = Arc<dyn Fn(&EndpointId) + Send + Sync>;

struct ActiveEndpoint {
    address: EndpointAddress,
    name: String,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    registry: EndpointRegistry,
    role: Role,
    policy: Arc<ConnectionPolicy>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    identity: watch::Receiver<Option<String>>,
    status: StatusBoard,
    active: Mutex<HashMap<EndpointId, ActiveEndpoint>>,
    hooks: Mutex<Vec<DeactivateHook>>,
    root: CancellationToken,
}

/// Cloneable handle to the supervisor.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        registry: EndpointRegistry,
        role: Role,
        policy: ConnectionPolicy,
        inbound_tx: mpsc::UnboundedSender<InboundEvent>,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        identity: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                role,
                policy: Arc::new(policy),
                inbound_tx,
                identity,
                status: StatusBoard::new(events_tx),
                active: Mutex::new(HashMap::new()),
                hooks: Mutex::new(Vec::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<EndpointId, ActiveEndpoint>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a callback run on every deactivation.
    pub fn on_deactivate(&self, hook: DeactivateHook) {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Start the transport for `id`. Idempotent while it is running.
    pub fn activate(&self, id: &EndpointId) -> ConnectionResult<()> {
        let snapshot = self.inner.registry.snapshot();
        let endpoint = snapshot
            .get(id)
            .ok_or_else(|| ConnectionError::UnknownEndpoint(id.clone()))?;

        let mut active = self.active();
        if let Some(existing) = active.get(id) {
            if !existing.task.is_finished() {
                return Ok(());
            }
            active.remove(id);
        }

        // At most one active endpoint per socket
        let port = endpoint.port();
        if let Some(other) = active.iter().find(|(other_id, other)| {
            *other_id != id
                && !other.task.is_finished()
                && endpoint.address.collides_at(port, &other.address)
        }) {
            return Err(ConnectionError::ConfigurationConflict {
                port,
                other: other.1.name.clone(),
            });
        }

        // Bind synchronously so a conflict surfaces to the caller
        let bound = match &endpoint.address {
            EndpointAddress::Listen { port } => {
                match listener::bind(&self.inner.policy.bind_host, *port) {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        error!("{} cannot listen: {}", endpoint.name, e);
                        self.inner.status.record_failure(id, &e.to_string());
                        self.inner.status.set_state(id, ConnectionState::Disconnected);
                        self.inner.status.emit(ConnectionEvent::Failed {
                            endpoint: id.clone(),
                            error: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
            EndpointAddress::Connect { .. } => None,
        };

        let cancel = self.inner.root.child_token();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let ctx = EndpointContext {
            id: id.clone(),
            role: self.inner.role,
            registry: self.inner.registry.clone(),
            policy: Arc::clone(&self.inner.policy),
            inbound_tx: self.inner.inbound_tx.clone(),
            identity: self.inner.identity.clone(),
            status: self.inner.status.clone(),
            cancel: cancel.clone(),
        };

        self.inner.status.set_state(id, ConnectionState::Connecting);
        let task = match bound {
            Some(socket) => tokio::spawn(listener::run_listener(ctx, socket, outbound_rx)),
            None => tokio::spawn(dialer::run_dialer(ctx, outbound_rx)),
        };

        info!("Endpoint {} [{}] activated on port {}", endpoint.name, id, port);
        active.insert(
            id.clone(),
            ActiveEndpoint {
                address: endpoint.address.clone(),
                name: endpoint.name.clone(),
                cancel,
                outbound: outbound_tx,
                task,
            },
        );
        Ok(())
    }

    /// Stop the transport for `id` and wait (bounded) for it to close. Idempotent.
    pub async fn deactivate(&self, id: &EndpointId) {
        let removed = self.active().remove(id);
        let hooks: Vec<DeactivateHook> = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(id);
        }

        let Some(endpoint) = removed else {
            self.inner.status.set_state(id, ConnectionState::Disconnected);
            return;
        };

        self.inner.status.set_state(id, ConnectionState::Closing);
        endpoint.cancel.cancel();
        wait_stopped(id, endpoint.task).await;
        self.inner.status.set_state(id, ConnectionState::Disconnected);
        info!("Endpoint {} [{}] deactivated", endpoint.name, id);
    }

    /// Deactivate, wait for the socket to be released, activate again.
    pub async fn restart(&self, id: &EndpointId) -> ConnectionResult<()> {
        self.deactivate(id).await;
        self.activate(id)
    }

    /// Hand a frame to the endpoint's transport.
    pub async fn send(&self, id: &EndpointId, frame: Frame) -> Result<(), SendError> {
        if self.inner.status.state(id) != ConnectionState::Connected {
            return Err(SendError::NotConnected(id.clone()));
        }
        let outbound = self
            .active()
            .get(id)
            .map(|a| a.outbound.clone())
            .ok_or_else(|| SendError::NotConnected(id.clone()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        outbound
            .send((frame, ack_tx))
            .map_err(|_| SendError::NotConnected(id.clone()))?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(SendError::NotConnected(id.clone())))
    }

    /// Whether a transport task is running for `id`.
    pub fn is_active(&self, id: &EndpointId) -> bool {
        self.active()
            .get(id)
            .is_some_and(|a| !a.task.is_finished())
    }

    pub fn info(&self, id: &EndpointId) -> ConnectionInfo {
        self.inner.status.get(id)
    }

    /// Current status of every registered endpoint, in registry order.
    pub fn status(&self) -> Vec<(Endpoint, ConnectionInfo)> {
        self.inner
            .registry
            .snapshot()
            .endpoints()
            .iter()
            .map(|e| (e.clone(), self.inner.status.get(&e.id)))
            .collect()
    }

    /// Activate every enabled endpoint. Failures are logged and left for the operator.
    pub fn activate_enabled(&self) {
        let snapshot = self.inner.registry.snapshot();
        for endpoint in snapshot.endpoints().iter().filter(|e| e.enabled) {
            if let Err(e) = self.activate(&endpoint.id) {
                warn!("Failed to activate {}: {}", endpoint.name, e);
            }
        }
    }

    /// Follow registry changes until shutdown.
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut rx = self.inner.registry.subscribe();
        let mut previous = rx.borrow_and_update().clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.root.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = rx.borrow_and_update().clone();
                        manager.reconcile(&previous, &current).await;
                        previous = current;
                    }
                }
            }
            debug!("Reconciler stopped");
        })
    }

    async fn reconcile(&self, previous: &RegistrySnapshot, current: &RegistrySnapshot) {
        for endpoint in current.endpoints() {
            let was_enabled = previous.get(&endpoint.id).is_some_and(|e| e.enabled);
            if endpoint.enabled && !was_enabled {
                if let Err(e) = self.activate(&endpoint.id) {
                    warn!("Failed to activate {}: {}", endpoint.name, e);
                }
            } else if !endpoint.enabled && was_enabled {
                self.deactivate(&endpoint.id).await;
            }
        }

        for endpoint in previous.endpoints() {
            if current.get(&endpoint.id).is_none() {
                self.deactivate(&endpoint.id).await;
                self.inner.status.remove(&endpoint.id);
            }
        }
    }

    /// Stop every transport and wait (bounded) for them to close.
    pub async fn shutdown(&self) {
        info!("Shutting down connections...");
        self.inner.root.cancel();
        let stopping: Vec<(EndpointId, JoinHandle<()>)> = self
            .active()
            .drain()
            .map(|(id, endpoint)| (id, endpoint.task))
            .collect();
        for (id, task) in stopping {
            wait_stopped(&id, task).await;
        }
    }
}

async fn wait_stopped(id: &EndpointId, task: JoinHandle<()>) {
    match tokio::time::timeout(STOP_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Transport task for {} panicked: {}", id, e),
        Err(_) => warn!("Transport for {} did not stop in time", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use crate::bridge::registry::tests::make_endpoint;
    use crate::common::types::{ChannelId, Site};

    struct Harness {
        manager: ConnectionManager,
        inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
        events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        identity_tx: watch::Sender<Option<String>>,
    }

    fn harness(endpoints: Vec<Endpoint>, role: Role) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (identity_tx, identity_rx) = watch::channel(None);
        let policy = ConnectionPolicy {
            reconnect_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
            ..ConnectionPolicy::default()
        };
        Harness {
            manager: ConnectionManager::new(
                EndpointRegistry::new(endpoints),
                role,
                policy,
                inbound_tx,
                events_tx,
                identity_rx,
            ),
            inbound_rx,
            events_rx,
            identity_tx,
        }
    }

    fn listen_endpoint(id: &str, port: u16) -> Endpoint {
        Endpoint {
            id: id.into(),
            name: id.to_uppercase(),
            address: EndpointAddress::Listen { port },
            channel: ChannelId(1),
            enabled: true,
            forward: true,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn wait_for_state(manager: &ConnectionManager, id: &EndpointId, state: ConnectionState) {
        for _ in 0..200 {
            if manager.info(id).state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("endpoint {} never reached {}", id, state);
    }

    async fn next_text<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
                Ok(Some(Ok(_))) => continue,
                other => panic!("no text frame: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_listener_greets_answers_ping_and_relays_chat() {
        let port = free_port();
        let mut h = harness(vec![listen_endpoint("l", port)], Role::Game);
        h.identity_tx.send_replace(Some("Steve".to_string()));
        let id = EndpointId::from("l");

        h.manager.activate(&id).unwrap();
        wait_for_state(&h.manager, &id, ConnectionState::Connected).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}", port))
            .await
            .unwrap();

        let hello = next_text(&mut ws).await;
        assert_eq!(hello["type"], "connection_status");
        assert_eq!(hello["playerName"], "Steve");

        ws.send(Message::Text(r#"{"type":"ping"}"#.to_string().into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await["type"], "pong");

        ws.send(Message::Text("{garbage".to_string().into())).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"discord_message","author":"Alex","content":"hello","messageId":"42"}"#
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), h.inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.site, Site::Endpoint(id.clone()));
        assert_eq!(event.author, "Alex");
        assert_eq!(event.origin_id.as_deref(), Some("42"));

        // Outbound frames reach the peer
        h.manager
            .send(
                &id,
                Frame::MinecraftMessage {
                    author: "Steve".to_string(),
                    content: "hi".to_string(),
                },
            )
            .await
            .unwrap();
        let chat = next_text(&mut ws).await;
        assert_eq!(chat["type"], "minecraft_message");
        assert_eq!(chat["content"], "hi");

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_without_peers_reports_not_connected() {
        let port = free_port();
        let h = harness(vec![listen_endpoint("l", port)], Role::Game);
        let id = EndpointId::from("l");

        h.manager.activate(&id).unwrap();
        wait_for_state(&h.manager, &id, ConnectionState::Connected).await;

        let result = h.manager.send(&id, Frame::Ping).await;
        assert!(matches!(result, Err(SendError::NotConnected(_))));
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_surfaces_without_retry() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let mut h = harness(vec![listen_endpoint("l", port)], Role::Game);
        let id = EndpointId::from("l");

        let err = h.manager.activate(&id).unwrap_err();
        assert!(matches!(err, ConnectionError::BindConflict { .. }));
        assert!(!h.manager.is_active(&id));

        let info = h.manager.info(&id);
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert!(info.last_error.unwrap().contains("port command"));

        let mut failed = false;
        while let Ok(event) = h.events_rx.try_recv() {
            failed |= matches!(event, ConnectionEvent::Failed { .. });
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_two_listeners_on_one_port_conflict() {
        let port = free_port();
        let h = harness(
            vec![listen_endpoint("a", port), listen_endpoint("b", port)],
            Role::Game,
        );

        h.manager.activate(&"a".into()).unwrap();
        let err = h.manager.activate(&"b".into()).unwrap_err();
        assert!(matches!(err, ConnectionError::ConfigurationConflict { .. }));
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_activate_is_idempotent_and_restart_rebinds() {
        let port = free_port();
        let h = harness(vec![listen_endpoint("l", port)], Role::Game);
        let id = EndpointId::from("l");

        h.manager.activate(&id).unwrap();
        h.manager.activate(&id).unwrap();
        wait_for_state(&h.manager, &id, ConnectionState::Connected).await;

        h.manager.restart(&id).await.unwrap();
        wait_for_state(&h.manager, &id, ConnectionState::Connected).await;

        h.manager.deactivate(&id).await;
        h.manager.deactivate(&id).await;
        assert_eq!(h.manager.info(&id).state, ConnectionState::Disconnected);
    }

    /// Accepts TCP and drops it immediately, like a foreign process on the port.
    async fn foreign_holder() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn spawn_dropper(listener: TcpListener) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
    }

    /// Find three consecutive free ports; the first two get held by droppers.
    async fn three_consecutive_ports() -> (u16, TcpListener, TcpListener) {
        for _ in 0..50 {
            let (first, base) = foreign_holder().await;
            let Some(second_port) = base.checked_add(1) else { continue };
            let Some(third_port) = base.checked_add(2) else { continue };
            let Ok(second) = TcpListener::bind(("127.0.0.1", second_port)).await else {
                continue;
            };
            if std::net::TcpListener::bind(("127.0.0.1", third_port)).is_err() {
                continue;
            }
            return (base, first, second);
        }
        panic!("no consecutive free ports");
    }

    #[tokio::test]
    async fn test_dialer_probes_past_foreign_ports_and_persists() {
        let (base, first, second) = three_consecutive_ports().await;
        spawn_dropper(first);
        spawn_dropper(second);

        // The real peer is a listen endpoint two ports up
        let server = harness(vec![listen_endpoint("srv", base + 2)], Role::Game);
        server.manager.activate(&"srv".into()).unwrap();
        wait_for_state(&server.manager, &"srv".into(), ConnectionState::Connected).await;

        let mut client = harness(vec![make_endpoint("c", 1, base)], Role::Platform);
        let id = EndpointId::from("c");
        client.manager.activate(&id).unwrap();
        wait_for_state(&client.manager, &id, ConnectionState::Connected).await;

        assert_eq!(client.manager.registry().snapshot().get(&id).unwrap().port(), base + 2);
        let mut updated = None;
        while let Ok(event) = client.events_rx.try_recv() {
            if let ConnectionEvent::ConfigUpdated { port, .. } = event {
                updated = Some(port);
            }
        }
        assert_eq!(updated, Some(base + 2));

        client.manager.shutdown().await;
        server.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabling_stops_reconnect_loop() {
        let (holder, port) = foreign_holder().await;
        drop(holder);

        let mut endpoint = make_endpoint("c", 1, port);
        endpoint.address = EndpointAddress::Connect {
            host: "127.0.0.1".to_string(),
            port,
        };
        let h = harness(vec![endpoint], Role::Platform);
        let id = EndpointId::from("c");
        let reconciler = h.manager.spawn_reconciler();

        h.manager.activate(&id).unwrap();
        wait_for_state(&h.manager, &id, ConnectionState::Disconnected).await;
        assert!(h.manager.is_active(&id));

        h.manager.registry().set_enabled(&id, false);
        for _ in 0..100 {
            if !h.manager.is_active(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.manager.is_active(&id));

        // No further attempts after the loop stopped
        let retries = h.manager.info(&id).retry_count;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.manager.info(&id).retry_count, retries);
        assert!(matches!(
            h.manager.send(&id, Frame::Ping).await,
            Err(SendError::NotConnected(_))
        ));

        h.manager.shutdown().await;
        reconciler.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconciler_follows_added_and_removed_endpoints() {
        let h = harness(vec![], Role::Game);
        let reconciler = h.manager.spawn_reconciler();
        let id = EndpointId::from("new");

        h.manager.registry().insert(listen_endpoint("new", free_port()));
        wait_for_state(&h.manager, &id, ConnectionState::Connected).await;
        assert_eq!(h.manager.status().len(), 1);

        assert!(h.manager.registry().remove(&id).is_some());
        for _ in 0..100 {
            if !h.manager.is_active(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.manager.is_active(&id));
        assert!(h.manager.status().is_empty());

        h.manager.shutdown().await;
        reconciler.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let h = harness(vec![], Role::Game);
        assert!(matches!(
            h.manager.activate(&"nope".into()),
            Err(ConnectionError::UnknownEndpoint(_))
        ));
    }
}
