//! One WebSocket conversation with a peer.
//!
//! Shared by accepted peers and dialed connections: announces the local
//! identity, answers pings, turns chat frames into inbound events and writes
//! whatever the owner hands it. Returns when the peer goes away or the
//! endpoint is cancelled.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bridge::registry::EndpointRegistry;
use crate::common::messages::InboundEvent;
use crate::common::reconnect::ConnectionPolicy;
use crate::common::types::{EndpointId, Role, Site};
use crate::protocol::frames::{self, Frame};
use crate::transport::status::StatusBoard;

/// Everything an endpoint task needs, cloned into each peer.
#[derive(Clone)]
pub(crate) struct EndpointContext {
    pub id: EndpointId,
    pub role: Role,
    pub registry: EndpointRegistry,
    pub policy: Arc<ConnectionPolicy>,
    pub inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    pub identity: watch::Receiver<Option<String>>,
    pub status: StatusBoard,
    pub cancel: CancellationToken,
}

impl EndpointContext {
    /// Status text sent alongside the identity.
    fn greeting(&self) -> &'static str {
        match self.role {
            Role::Game => "Connected to Minecraft",
            Role::Platform => "Connected to Discord",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Close frame or EOF from the peer.
    PeerClosed,
    /// The endpoint was deactivated; a normal closure was sent.
    Cancelled,
    Error(String),
}

/// Drive one WebSocket until it closes.
///
/// `outgoing` carries encoded frames to write. `heartbeat` enables periodic
/// `ping` frames (dialed connections).
pub(crate) async fn run_session<S>(
    ws: WebSocketStream<S>,
    ctx: &EndpointContext,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    heartbeat: bool,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut identity = ctx.identity.clone();

    // Announce who we are; if that is not known yet, keep watching for a while
    let known = identity.borrow_and_update().clone();
    let mut awaiting_identity = known.is_none();
    let hello = Frame::connected(ctx.greeting(), known);
    if ws_tx.send(Message::Text(frames::encode(&hello).into())).await.is_err() {
        return SessionEnd::Error("failed to send connection status".to_string());
    }
    let identity_deadline = tokio::time::sleep(ctx.policy.identity_wait);
    tokio::pin!(identity_deadline);

    let period = ctx.policy.heartbeat_interval;
    let mut pings = interval_at(Instant::now() + period, period);
    pings.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "Endpoint deactivated".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close))).await;
                return SessionEnd::Cancelled;
            }

            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_text(ctx, &text) {
                        if ws_tx.send(Message::Text(frames::encode(&reply).into())).await.is_err() {
                            return SessionEnd::Error("failed to send reply".to_string());
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => ctx.status.touch(&ctx.id),
                Some(Ok(Message::Close(_))) | None => return SessionEnd::PeerClosed,
                Some(Err(e)) => return SessionEnd::Error(e.to_string()),
                // Binary is not part of the protocol; protocol pings are auto-answered
                Some(Ok(_)) => {}
            },

            Some(text) = outgoing.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    return SessionEnd::Error(e.to_string());
                }
            }

            _ = pings.tick(), if heartbeat => {
                if ws_tx.send(Message::Text(frames::encode(&Frame::Ping).into())).await.is_err() {
                    return SessionEnd::Error("failed to send ping".to_string());
                }
            }

            changed = identity.changed(), if awaiting_identity => {
                if changed.is_err() {
                    awaiting_identity = false;
                    continue;
                }
                let name = identity.borrow_and_update().clone();
                if name.is_some() {
                    awaiting_identity = false;
                    debug!("Endpoint {} sending late identity", ctx.id);
                    let update = Frame::connected("Player name update", name);
                    if ws_tx.send(Message::Text(frames::encode(&update).into())).await.is_err() {
                        return SessionEnd::Error("failed to send identity".to_string());
                    }
                }
            }

            _ = &mut identity_deadline, if awaiting_identity => {
                awaiting_identity = false;
            }
        }
    }
}

/// Handle one text frame; returns a frame to send back, if any.
fn handle_text(ctx: &EndpointContext, text: &str) -> Option<Frame> {
    let frame = match frames::decode(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(e) => {
            debug!("Endpoint {} dropping malformed frame: {}", ctx.id, e);
            return None;
        }
    };
    ctx.status.touch(&ctx.id);
    trace!("Endpoint {} received {}", ctx.id, frame.kind());

    match frame {
        Frame::DiscordMessage {
            author,
            content,
            message_id,
        } => {
            forward(ctx, author, content, message_id);
            None
        }
        Frame::MinecraftMessage { author, content } => {
            forward(ctx, author, content, None);
            None
        }
        Frame::Ping => Some(Frame::Pong),
        Frame::Pong => None,
        Frame::ConnectionStatus {
            status,
            message,
            player_name,
        } => {
            info!("Endpoint {} peer status {:?}: {}", ctx.id, status, message);
            if let Some(name) = player_name.filter(|n| !n.is_empty()) {
                ctx.status.set_peer_name(&ctx.id, &name);
            }
            None
        }
    }
}

fn forward(ctx: &EndpointContext, author: String, content: String, origin_id: Option<String>) {
    if content.trim().is_empty() {
        return;
    }
    let event = InboundEvent::new(Site::Endpoint(ctx.id.clone()), author, content).with_origin_id(origin_id);
    if ctx.inbound_tx.send(event).is_err() {
        warn!("Relay is gone, dropping inbound message from {}", ctx.id);
    }
}
