//! Reconnection and port-probing policy.

use std::time::Duration;

use backon::BackoffBuilder;

/// Timing and retry policy for endpoint connections.
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    /// Fixed delay between reconnection attempts after an unsolicited drop.
    pub reconnect_interval: Duration,
    /// How many ports above the configured one a dialer may probe.
    pub probe_attempts: u32,
    /// Upper bound on a single dial, including the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Interval between liveness probes on dialed connections.
    pub heartbeat_interval: Duration,
    /// How long a listen-mode peer waits for the local identity to become known.
    pub identity_wait: Duration,
    /// Address listen-mode endpoints bind to.
    pub bind_host: String,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            probe_attempts: 10,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            identity_wait: Duration::from_secs(15),
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

impl ConnectionPolicy {
    /// Delays for the reconnect loop: a constant interval, unlimited retries.
    pub fn reconnect_backoff(&self) -> impl Iterator<Item = Duration> {
        backon::ExponentialBuilder::default()
            .with_min_delay(self.reconnect_interval)
            .with_max_delay(self.reconnect_interval)
            .with_factor(1.0)
            .without_max_times()
            .build()
    }
}

/// Candidate ports for probing after `base` failed.
///
/// Yields `base+1 ..= base+attempts`, skipping ports for which `claimed`
/// returns true. Skipped ports still consume an attempt.
pub fn probe_ports(base: u16, attempts: u32, claimed: impl Fn(u16) -> bool) -> Vec<u16> {
    (1..=attempts)
        .filter_map(|offset| u16::try_from(u32::from(base) + offset).ok())
        .filter(|port| !claimed(*port))
        .collect()
}
