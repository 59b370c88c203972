//! Builds simulated quantum networks from a declarative topology and runs
//! node programs on them.
//!
//! A [`TopologyConfig`] lists end nodes, direct links, metropolitan hubs and
//! repeater chains. [`NetworkBuilder`] resolves every model kind against its
//! registries, constructs nodes, classical ports, entanglement links, hub
//! schedulers and EGPs, and hands back a [`Network`]. [`run`] then executes
//! one [`Program`] per node on the discrete-event simulation.

/// Topology construction and the model registries.
pub mod builder;

/// Classical message channels.
pub mod clink;

/// Topology configuration.
pub mod config;

/// Start/stop of every protocol object in the network.
pub mod controller;

/// Per-node entanglement generation protocol.
pub mod egp;

/// Entanglement links and their physical models.
pub mod link;

/// The built network.
pub mod network;

pub mod node;

/// Quantum memory devices.
pub mod qdevice;

/// Request and result types of the entanglement service.
pub mod qlink;

pub mod runner;

/// Hub schedulers arbitrating access to shared links.
pub mod scheduler;

/// Deterministic discrete-event simulation.
pub mod simulation;

/// Logging infrastructure.
#[cfg_attr(test, allow(dead_code))]
pub mod tracing;

pub use builder::{BuildError, NetworkBuilder};
pub use config::{set_logger, TopologyConfig};
pub use network::{Network, NetworkError};
pub use runner::{run, Program, ProtocolContext};
