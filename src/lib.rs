//! Swarm – a control plane for a swarm of virtual pointers
//!
//! This crate implements:
//! - An entity store stepped at a fixed tick by per-entity behaviors
//! - A line protocol over a command socket and a JSON event stream
//! - Supervised script subprocesses that drive scripted entities
//! - Save/load of the swarm and a hot-reloaded config file
//! - A heartbeat file and an external watchdog that restarts a stalled worker

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Worker runtime
pub mod runtime;

/// Heartbeat-based worker supervision
pub mod watchdog;

pub use runtime::{Runtime, SwarmConfig};

/// Current version of the swarm worker
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the command/event line protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";
