//! Node-observation persistence contract and the in-memory known-node
//! cache.
//!
//! Storage itself is an external collaborator behind [`NodeSink`]; the
//! engine only writes through it, best-effort, and never from the
//! coordinator task. The cache keeps the latest observation per node so
//! `known_nodes()` can answer without touching the sink.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;
use trellis_common::NodeId;

/// Error from a sink operation. Sinks are best-effort; callers log and
/// continue.
#[derive(Debug, Error)]
#[error("node sink error: {0}")]
pub struct SinkError(pub String);

/// What the engine learned about a node from one completed handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeObservation {
    /// When the first frame of the protocol-handshake reply arrived.
    pub last_connected_at: DateTime<Utc>,
    /// Observed remote IP.
    pub ip: IpAddr,
    /// The node's TCP listening port, when known (resolved for inbound
    /// connections, the dialed port for outbound).
    pub tcp_port: u16,
    /// Source port of this connection. Distinct key from `tcp_port`.
    pub remote_port: u16,
    /// Base protocol version from the hello.
    pub p2p_version: u32,
    /// Client name from the hello.
    pub client_name: String,
    /// Comma-joined capability list from the hello.
    pub caps: String,
    /// Listening port the node claimed in its hello.
    pub listen_port: u16,
}

/// Cached summary of a node ever seen, served by `known_nodes()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownNodeRecord {
    /// Hex digest of the identifier.
    pub digest: String,
    /// Latest observation.
    #[serde(flatten)]
    pub observation: NodeObservation,
}

/// Write-through hooks for node observations. May be absent; all
/// methods are best-effort.
pub trait NodeSink: Send + Sync {
    /// Open the underlying handle. Called once at server start.
    ///
    /// # Errors
    ///
    /// An error here aborts start.
    fn open(&self) -> Result<(), SinkError>;

    /// Load previously recorded nodes to warm the in-memory cache.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the backing store cannot be read.
    fn load_known(&self) -> Result<Vec<(NodeId, KnownNodeRecord)>, SinkError>;

    /// Record connection-attempt counters for a node.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on write failure; callers log and continue.
    fn record_meta(
        &self,
        id: &NodeId,
        digest: &str,
        dialed: bool,
        accepted: bool,
        too_many_peers: bool,
    ) -> Result<(), SinkError>;

    /// Record a full observation for a node.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on write failure; callers log and continue.
    fn record_info(&self, id: &NodeId, record: &KnownNodeRecord) -> Result<(), SinkError>;

    /// Close the underlying handle. Called once during stop, after the
    /// coordinator has exited.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on close failure; stop logs and continues.
    fn close(&self) -> Result<(), SinkError>;
}

/// Whether a fresh observation differs enough from the cached one to
/// warrant a full re-record rather than a last-seen touch-up.
fn info_changed(old: &NodeObservation, new: &NodeObservation) -> bool {
    old.ip != new.ip
        || old.tcp_port != new.tcp_port
        || old.p2p_version != new.p2p_version
        || old.client_name != new.client_name
        || old.caps != new.caps
        || old.listen_port != new.listen_port
}

/// Apply an observation to the cache and write it through the sink.
///
/// New nodes are inserted and fully recorded. Known nodes get their
/// last-connected time and remote port refreshed; when the address or
/// hello content changed the full record is written again.
pub(crate) fn store_observation(
    cache: &DashMap<NodeId, KnownNodeRecord>,
    sink: Option<&dyn NodeSink>,
    id: NodeId,
    observation: NodeObservation,
) {
    let record = match cache.get_mut(&id) {
        None => {
            let record = KnownNodeRecord {
                digest: id.digest(),
                observation,
            };
            cache.insert(id, record.clone());
            Some(record)
        }
        Some(mut entry) => {
            let changed = info_changed(&entry.observation, &observation);
            if changed {
                entry.observation = observation;
            } else {
                entry.observation.last_connected_at = observation.last_connected_at;
                entry.observation.remote_port = observation.remote_port;
            }
            changed.then(|| entry.clone())
        }
    };
    if let (Some(sink), Some(record)) = (sink, record) {
        if let Err(e) = sink.record_info(&id, &record) {
            warn!(id = %id, "failed to record node info: {e}");
        }
    }
}

/// Write attempt counters through the sink, logging failures.
pub(crate) fn record_meta(
    sink: Option<&dyn NodeSink>,
    id: &NodeId,
    dialed: bool,
    accepted: bool,
    too_many_peers: bool,
) {
    if let Some(sink) = sink {
        if let Err(e) = sink.record_meta(id, &id.digest(), dialed, accepted, too_many_peers) {
            warn!(id = %id, "failed to record node meta: {e}");
        }
    }
}
