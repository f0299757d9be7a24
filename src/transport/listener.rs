//! Listen-mode endpoints: bind a local port and serve any number of peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

use crate::common::error::{ConnectionError, ConnectionResult, SendError};
use crate::common::types::ConnectionState;
use crate::protocol::frames;
use crate::transport::session::{run_session, EndpointContext, SessionEnd};
use crate::transport::Outbound;

/// How long a stopping listener waits for peers to finish their close handshake.
const PEER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum PeerEvent {
    Joined(u64, mpsc::UnboundedSender<String>),
    Left(u64),
}

/// Bind `host:port` with address reuse. Address-in-use becomes [`ConnectionError::BindConflict`].
pub(crate) fn bind(host: &str, port: u16) -> ConnectionResult<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|_| {
        ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid bind address {}:{}", host, port),
        ))
    })?;

    let in_use = |e: std::io::Error| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            ConnectionError::BindConflict { port }
        } else {
            ConnectionError::Io(e)
        }
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr).map_err(in_use)?;
    socket.listen(128).map_err(in_use)
}

/// Serve a bound listener until cancelled.
pub(crate) async fn run_listener(
    ctx: EndpointContext,
    listener: TcpListener,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let port = listener.local_addr().map(|a| a.port()).ok();
    ctx.status.update(&ctx.id, |info| info.bound_port = port);
    ctx.status.set_state(&ctx.id, ConnectionState::Connected);
    info!("Endpoint {} listening for peers on {:?}", ctx.id, port);

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<PeerEvent>();
    let mut peers: HashMap<u64, mpsc::UnboundedSender<String>> = HashMap::new();
    let mut tasks = JoinSet::new();
    let mut next_peer = 0u64;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    next_peer += 1;
                    tasks.spawn(serve_peer(ctx.clone(), next_peer, stream, addr, peer_tx.clone()));
                }
                Err(e) => warn!("Endpoint {} accept failed: {}", ctx.id, e),
            },

            Some(event) = peer_rx.recv() => {
                match event {
                    PeerEvent::Joined(id, tx) => {
                        peers.insert(id, tx);
                    }
                    PeerEvent::Left(id) => {
                        peers.remove(&id);
                    }
                }
                ctx.status.set_peers(&ctx.id, peers.len());
            }

            Some((frame, ack)) = outbound.recv() => {
                let text = frames::encode(&frame);
                peers.retain(|_, tx| tx.send(text.clone()).is_ok());
                let result = if peers.is_empty() {
                    Err(SendError::NotConnected(ctx.id.clone()))
                } else {
                    Ok(())
                };
                let _ = ack.send(result);
            }

            // Reap finished peer tasks
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    ctx.status.set_state(&ctx.id, ConnectionState::Closing);
    let drained = tokio::time::timeout(PEER_DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tasks.abort_all();
    }
    ctx.status.set_peers(&ctx.id, 0);
    info!("Listener for {} stopped", ctx.id);
}

async fn serve_peer(
    ctx: EndpointContext,
    peer: u64,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let ws = match tokio::time::timeout(ctx.policy.connect_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("Endpoint {} handshake with {} failed: {}", ctx.id, addr, e);
            return;
        }
        Err(_) => {
            debug!("Endpoint {} handshake with {} timed out", ctx.id, addr);
            return;
        }
    };

    info!("Endpoint {} peer {} connected", ctx.id, addr);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = events.send(PeerEvent::Joined(peer, tx));

    match run_session(ws, &ctx, &mut rx, false).await {
        SessionEnd::PeerClosed => info!("Endpoint {} peer {} disconnected", ctx.id, addr),
        SessionEnd::Cancelled => debug!("Endpoint {} peer {} closed by deactivation", ctx.id, addr),
        SessionEnd::Error(e) => info!("Endpoint {} peer {} dropped: {}", ctx.id, addr, e),
    }
    let _ = events.send(PeerEvent::Left(peer));
}
