//! Relay core: endpoint registry, routing, duplicate/echo suppression and
//! ordered delivery.
//!
//! ## Module Structure
//!
//! - `registry`: Endpoint definitions and published snapshots
//! - `router`: Destination resolution per process role
//! - `normalize` / `dedup`: Fingerprinting and the seen/echo tables
//! - `formatter`: Per-destination rendering
//! - `queue`: Per-destination FIFO with a single drain worker
//! - `orchestrator`: The `Relay` pipeline and its worker pool
//! - `commands`: Operator command surface
//! - `monitor`: Connection notifications (logging, persistence, notices)
//! - `channels` / `sink`: Wiring to transports and local surfaces

pub mod channels;
pub mod commands;
pub mod dedup;
pub mod formatter;
pub mod monitor;
pub mod normalize;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod router;
pub mod sink;

pub use channels::ChannelBundle;
pub use commands::CommandSurface;
pub use dedup::{DedupEngine, Verdict};
pub use monitor::StatusMonitor;
pub use orchestrator::Relay;
pub use registry::{Endpoint, EndpointAddress, EndpointRegistry, RegistrySnapshot};
pub use router::{MessageRouter, Route};
pub use sink::{GameSink, PlatformSink, Sinks};
