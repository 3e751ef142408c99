//! Peer lifecycle events.

use serde::Serialize;
use trellis_common::NodeId;

/// What happened to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerEventKind {
    /// A peer passed both gates and is running.
    Add,
    /// A peer's runner returned and the peer was removed.
    Drop,
    /// A message was written to a peer (only with `enable_msg_events`).
    MsgSend,
    /// A message was read from a peer (only with `enable_msg_events`).
    MsgRecv,
}

/// An entry on the server's event feed.
#[derive(Clone, Debug, Serialize)]
pub struct PeerEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: PeerEventKind,
    /// The peer's identifier.
    pub peer: NodeId,
    /// Error string from the peer runner, set on drops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Peer-map size after the add or drop was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_peers: Option<usize>,
    /// Absolute message code, set on msg events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_code: Option<u8>,
}

impl PeerEvent {
    pub(crate) fn add(peer: NodeId, num_peers: usize) -> Self {
        Self {
            kind: PeerEventKind::Add,
            peer,
            error: None,
            num_peers: Some(num_peers),
            msg_code: None,
        }
    }

    pub(crate) fn drop_(peer: NodeId, error: Option<String>, num_peers: usize) -> Self {
        Self {
            kind: PeerEventKind::Drop,
            peer,
            error,
            num_peers: Some(num_peers),
            msg_code: None,
        }
    }

    pub(crate) fn msg(kind: PeerEventKind, peer: NodeId, code: u8) -> Self {
        Self {
            kind,
            peer,
            error: None,
            num_peers: None,
            msg_code: Some(code),
        }
    }
}
