//! Resilience and dispatch layer for a fleet of Model Context Protocol (MCP)
//! upstream servers.
//!
//! This crate aggregates a dynamic pool of upstream MCP servers behind a
//! single [`fleet::FleetManager`], dispatching `callTool`/`readResource`
//! requests with load balancing, health-aware routing, automatic failover
//! and staggered recovery, fleet-wide concurrency control, and an
//! observable event/alert stream. Wire-level MCP framing and the frontend
//! that accepts client connections are out of scope — see `main.rs` for an
//! example HTTP frontend built on top of this library.

pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fleet;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod recovery;
pub mod selector;
pub mod stats;
pub mod transport;
pub mod types;

pub use config::FleetConfig;
pub use error::{ErrorKind, FleetError};
pub use fleet::{ConnectionStatus, FleetManager, FleetStatus};
pub use types::{Alert, AlertSeverity, ConnectionState, TransportKind, UpstreamDescriptor};
