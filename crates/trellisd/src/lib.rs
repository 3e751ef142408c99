//! trellisd — connection lifecycle engine for the trellis overlay.
//!
//! The server maintains a live population of authenticated connections
//! to remote nodes: it schedules outbound dials, throttles inbound
//! acceptance, drives each connection through a two-phase handshake
//! with coordinator checkpoints, enforces peer-set admission, and shuts
//! down in order. Sub-protocol logic, the encrypted transport, node
//! discovery, and observation storage are collaborators behind traits.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod conn;
mod dial;
/// Discovery-table contract and in-process implementation.
pub mod discovery;
/// Error types for server control operations.
pub mod error;
/// Peer lifecycle events.
pub mod events;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Admitted peers and the sub-protocol contract.
pub mod peer;
/// Node-observation sink contract and known-node cache types.
pub mod persist;
/// The server: acceptor, handshake pipeline, coordinator, control API.
pub mod server;
/// Transport contract, reference framed transport, and dialer.
pub mod transport;

pub use config::{Args, Config};
pub use conn::ConnFlags;
pub use error::ServerError;
pub use events::{PeerEvent, PeerEventKind};
pub use peer::{PeerInfo, ProtoMsg, ProtoPeer, ProtoSender, Protocol};
pub use server::{KnownNodeEntry, NodeInfo, Server};
