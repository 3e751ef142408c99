//! In-flight connection records and coordinator checkpoint messages.

use bitflags::bitflags;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use trellis_common::{Cap, DisconnectReason, NodeId};

use crate::transport::Transport;

bitflags! {
    /// Provenance and trust flags for a connection. Exactly one of the
    /// provenance bits (dyn/static/inbound) is set; `TRUSTED` is
    /// orthogonal and may be added by the coordinator at gate 1.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnFlags: u8 {
        /// Dialed from a discovery candidate.
        const DYN_DIALED = 1 << 0;
        /// Dialed because the node is in the static set.
        const STATIC_DIALED = 1 << 1;
        /// Accepted by the listener.
        const INBOUND = 1 << 2;
        /// The identifier is in the trusted set.
        const TRUSTED = 1 << 3;
    }
}

impl fmt::Display for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(2);
        if self.contains(ConnFlags::TRUSTED) {
            parts.push("trusted");
        }
        if self.contains(ConnFlags::DYN_DIALED) {
            parts.push("dyndial");
        }
        if self.contains(ConnFlags::STATIC_DIALED) {
            parts.push("staticdial");
        }
        if self.contains(ConnFlags::INBOUND) {
            parts.push("inbound");
        }
        f.write_str(&parts.join("-"))
    }
}

/// A connection making its way through the two handshakes. Created by
/// the acceptor or a dial task, destroyed on rejection, failure, or
/// peer drop.
pub(crate) struct Conn {
    /// Bound transport instance.
    pub transport: Box<dyn Transport>,
    /// Provenance and trust flags.
    pub flags: ConnFlags,
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// Remote identifier; zero until the encryption handshake.
    pub id: NodeId,
    /// Capabilities; empty until the protocol handshake.
    pub caps: Vec<Cap>,
    /// Client name; empty until the protocol handshake.
    pub name: String,
}

impl Conn {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        flags: ConnFlags,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            transport,
            flags,
            remote_addr,
            id: NodeId::zero(),
            caps: Vec::new(),
            name: String::new(),
        }
    }

    pub(crate) fn is(&self, flags: ConnFlags) -> bool {
        self.flags.intersects(flags)
    }

    /// Close the transport with a reason and drop the record.
    pub(crate) async fn close(mut self, reason: Option<DisconnectReason>) {
        self.transport.close(reason).await;
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flags)?;
        if !self.id.is_zero() {
            write!(f, " {:?}", self.id)?;
        }
        write!(f, " {}", self.remote_addr)
    }
}

/// Reply to a checkpoint: on rejection the connection comes back with
/// the reason so the runner can close it.
pub(crate) type GateReply<T> = Result<T, (Conn, DisconnectReason)>;

/// Gate-1 checkpoint message, sent after the encryption handshake. An
/// admitted connection is returned to the runner (possibly with the
/// trusted flag added).
pub(crate) struct PostHandshakeMsg {
    pub conn: Conn,
    pub reply: oneshot::Sender<GateReply<Conn>>,
}

/// Gate-2 checkpoint message, sent after the protocol handshake. On
/// admission the coordinator consumes the connection into a peer before
/// replying.
pub(crate) struct AddPeerMsg {
    pub conn: Conn,
    pub reply: oneshot::Sender<GateReply<()>>,
}
