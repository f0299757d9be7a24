//! Connect-mode endpoints: dial a remote WebSocket server and keep the
//! connection up.
//!
//! A refused dial on the configured port makes the dialer probe the next
//! ports; the first one that completes a WebSocket handshake becomes the
//! endpoint's configured port. A dropped connection is retried on a fixed
//! interval for as long as the endpoint stays enabled.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::bridge::registry::EndpointAddress;
use crate::common::error::{ConnectionError, ConnectionResult, SendError};
use crate::common::reconnect::probe_ports;
use crate::common::types::ConnectionState;
use crate::protocol::frames;
use crate::transport::session::{run_session, EndpointContext, SessionEnd};
use crate::transport::status::ConnectionEvent;
use crate::transport::Outbound;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial `ws://host:port`, bounded by `timeout`.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    timeout: std::time::Duration,
) -> ConnectionResult<ClientStream> {
    let url = format!("ws://{}:{}", host, port);
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(tungstenite::Error::Io(e))) => Err(ConnectionError::ConnectFailed {
            host: host.to_string(),
            port,
            message: e.to_string(),
        }),
        Ok(Err(e)) => Err(ConnectionError::Handshake {
            host: host.to_string(),
            port,
            message: e.to_string(),
        }),
        Err(_) => Err(ConnectionError::ConnectFailed {
            host: host.to_string(),
            port,
            message: "connect timed out".to_string(),
        }),
    }
}

/// Keep one endpoint connected until cancelled, disabled or removed.
pub(crate) async fn run_dialer(ctx: EndpointContext, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    let mut backoff = ctx.policy.reconnect_backoff();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // Re-read configuration on every attempt
        let snapshot = ctx.registry.snapshot();
        let Some(endpoint) = snapshot.get(&ctx.id).filter(|e| e.enabled) else {
            debug!("Endpoint {} disabled or removed, stopping reconnect loop", ctx.id);
            break;
        };
        let EndpointAddress::Connect { host, port } = endpoint.address.clone() else {
            warn!("Dialer started for listen-mode endpoint {}", ctx.id);
            break;
        };

        ctx.status.set_state(&ctx.id, ConnectionState::Connecting);
        let attempt = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            result = connect_with_probe(&ctx, &endpoint.address, &host, port) => result,
        };

        match attempt {
            Ok((ws, connected_port)) => {
                backoff = ctx.policy.reconnect_backoff();
                info!("Endpoint {} connected to {}:{}", ctx.id, host, connected_port);
                ctx.status.update(&ctx.id, |info| info.bound_port = Some(connected_port));
                ctx.status.set_state(&ctx.id, ConnectionState::Connected);
                ctx.status.set_peers(&ctx.id, 1);

                let end = serve(&ctx, ws, &mut outbound).await;
                ctx.status.set_peers(&ctx.id, 0);
                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::PeerClosed => {
                        info!("Endpoint {} connection closed by remote", ctx.id);
                        ctx.status.record_failure(&ctx.id, "closed by remote");
                    }
                    SessionEnd::Error(e) => {
                        warn!("Endpoint {} connection lost: {}", ctx.id, e);
                        ctx.status.record_failure(&ctx.id, &e);
                    }
                }
            }
            Err(e) => {
                warn!("Endpoint {} connect failed: {}", ctx.id, e);
                ctx.status.record_failure(&ctx.id, &e.to_string());
            }
        }

        ctx.status.set_state(&ctx.id, ConnectionState::Disconnected);
        let delay = backoff.next().unwrap_or(ctx.policy.reconnect_interval);
        debug!("Endpoint {} reconnecting in {:.1}s", ctx.id, delay.as_secs_f64());

        // Wait out the interval; anything sent meanwhile is refused
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return finish(&ctx),
                _ = &mut sleep => break,
                Some((_, ack)) = outbound.recv() => {
                    let _ = ack.send(Err(SendError::NotConnected(ctx.id.clone())));
                }
            }
        }
    }

    finish(&ctx);
}

fn finish(ctx: &EndpointContext) {
    ctx.status.set_state(&ctx.id, ConnectionState::Disconnected);
    debug!("Dialer for {} stopped", ctx.id);
}

/// Dial the configured port; on a refusal probe the ports above it.
async fn connect_with_probe(
    ctx: &EndpointContext,
    address: &EndpointAddress,
    host: &str,
    port: u16,
) -> ConnectionResult<(ClientStream, u16)> {
    let first = match dial(host, port, ctx.policy.connect_timeout).await {
        Ok(ws) => return Ok((ws, port)),
        Err(e) if e.is_probe_eligible() => e,
        Err(e) => return Err(e),
    };
    debug!("Endpoint {} configured port failed ({}), probing alternatives", ctx.id, first);

    ctx.status.set_state(&ctx.id, ConnectionState::PortRetry);
    let snapshot = ctx.registry.snapshot();
    let candidates = probe_ports(port, ctx.policy.probe_attempts, |p| {
        snapshot.port_claimed_by(address, p, &ctx.id).is_some()
    });

    for candidate in candidates {
        match dial(host, candidate, ctx.policy.connect_timeout).await {
            Ok(ws) => {
                info!("Endpoint {} found peer on port {} (configured {})", ctx.id, candidate, port);
                ctx.registry.set_port(&ctx.id, candidate);
                ctx.status.emit(ConnectionEvent::ConfigUpdated {
                    endpoint: ctx.id.clone(),
                    port: candidate,
                });
                return Ok((ws, candidate));
            }
            Err(e) => debug!("Endpoint {} port {} failed: {}", ctx.id, candidate, e),
        }
    }

    Err(ConnectionError::PortProbeExhausted {
        base: port,
        attempts: ctx.policy.probe_attempts,
    })
}

/// Run the session while forwarding queued frames into it.
async fn serve(
    ctx: &EndpointContext,
    ws: ClientStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> SessionEnd {
    let (text_tx, mut text_rx) = mpsc::unbounded_channel();
    let session = run_session(ws, ctx, &mut text_rx, true);
    tokio::pin!(session);

    loop {
        tokio::select! {
            end = &mut session => return end,
            Some((frame, ack)) = outbound.recv() => {
                let result = text_tx
                    .send(frames::encode(&frame))
                    .map_err(|_| SendError::NotConnected(ctx.id.clone()));
                let _ = ack.send(result);
            }
        }
    }
}
