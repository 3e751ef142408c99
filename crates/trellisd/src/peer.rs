//! Admitted peers and sub-protocol plumbing.
//!
//! A [`Peer`] exists only after a connection has passed both gates. The
//! coordinator keeps a [`PeerHandle`] in the peer map; the peer runner
//! owns the transport and drives base-protocol traffic plus one task
//! per matched sub-protocol.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, trace};
use trellis_common::{Cap, DisconnectReason, NodeId};

use crate::conn::{Conn, ConnFlags};
use crate::events::{PeerEvent, PeerEventKind};
use crate::transport::{base_msg, Frame, Transport, BASE_PROTOCOL_LENGTH};

/// Interval between base-protocol pings.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// A message within a sub-protocol's code space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtoMsg {
    /// Code relative to the protocol's offset.
    pub code: u8,
    /// Payload.
    pub data: Bytes,
}

/// Error sending on a peer whose runner has gone away.
#[derive(Debug, thiserror::Error)]
#[error("peer connection closed")]
pub struct PeerGone;

/// Outbound handle given to a sub-protocol runner. Relative codes are
/// shifted into the protocol's allotted range.
#[derive(Clone)]
pub struct ProtoSender {
    outbound: mpsc::Sender<Frame>,
    offset: u8,
    len: u8,
}

impl ProtoSender {
    /// Send a message with a protocol-relative code.
    ///
    /// # Errors
    ///
    /// Returns [`PeerGone`] when the peer runner has exited, or when
    /// `code` is outside the protocol's declared code space.
    pub async fn send(&self, code: u8, data: Bytes) -> Result<(), PeerGone> {
        if code >= self.len {
            return Err(PeerGone);
        }
        self.outbound
            .send(Frame::new(self.offset + code, data))
            .await
            .map_err(|_| PeerGone)
    }
}

/// What a sub-protocol runner gets for one peer.
pub struct ProtoPeer {
    /// The remote identifier.
    pub remote_id: NodeId,
    /// The negotiated capability.
    pub cap: Cap,
    /// Inbound messages for this protocol.
    pub rx: mpsc::Receiver<ProtoMsg>,
    /// Outbound sender.
    pub tx: ProtoSender,
}

/// A sub-protocol the server speaks. Runners are external logic; the
/// engine matches capabilities, allocates code space, and routes frames.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Capability name.
    fn name(&self) -> &str;
    /// Capability version.
    fn version(&self) -> u32;
    /// Size of the protocol's message-code space.
    fn msg_count(&self) -> u8;
    /// Protocol metadata for `node_info()` reports.
    fn node_info(&self) -> Option<serde_json::Value> {
        None
    }
    /// Exchange messages with one admitted peer. Returning ends the
    /// peer; an error carries the disconnect reason sent to the remote.
    async fn run(&self, peer: ProtoPeer) -> Result<(), DisconnectReason>;
}

/// Capability advertised by a [`Protocol`].
pub(crate) fn proto_cap(p: &dyn Protocol) -> Cap {
    Cap::new(p.name(), p.version())
}

/// A matched sub-protocol with its assigned code-space offset.
pub(crate) struct MatchedProto {
    pub proto: Arc<dyn Protocol>,
    pub cap: Cap,
    pub offset: u8,
}

/// Negotiate sub-protocols: for each name both sides support, pick the
/// highest shared version, then assign consecutive code-space offsets
/// above the base range in name order.
pub(crate) fn match_protocols(
    ours: &[Arc<dyn Protocol>],
    remote_caps: &[Cap],
) -> Vec<MatchedProto> {
    let mut chosen: BTreeMap<&str, &Arc<dyn Protocol>> = BTreeMap::new();
    for proto in ours {
        let cap = proto_cap(proto.as_ref());
        if !remote_caps.contains(&cap) {
            continue;
        }
        match chosen.get(proto.name()) {
            Some(prev) if prev.version() >= proto.version() => {}
            _ => {
                chosen.insert(proto.name(), proto);
            }
        }
    }

    let mut offset = BASE_PROTOCOL_LENGTH;
    chosen
        .into_values()
        .map(|proto| {
            let m = MatchedProto {
                proto: proto.clone(),
                cap: proto_cap(proto.as_ref()),
                offset,
            };
            offset = offset.saturating_add(proto.msg_count());
            m
        })
        .collect()
}

/// Public snapshot of one connected peer.
#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    /// Hex identifier.
    pub id: String,
    /// Client name from the hello.
    pub name: String,
    /// Advertised capabilities.
    pub caps: Vec<String>,
    /// Connection-level details.
    pub network: PeerNetworkInfo,
}

/// Connection-level details of one peer.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNetworkInfo {
    /// Remote socket address.
    pub remote_address: String,
    /// Whether the listener accepted this connection.
    pub inbound: bool,
    /// Whether the peer bypasses the cap.
    pub trusted: bool,
    /// Whether the peer was dialed from the static set.
    pub static_node: bool,
}

/// Coordinator-side record of a running peer.
pub(crate) struct PeerHandle {
    pub id: NodeId,
    pub name: String,
    pub caps: Vec<Cap>,
    pub flags: ConnFlags,
    pub remote_addr: SocketAddr,
    pub created: Instant,
    pub disconnect_tx: mpsc::Sender<DisconnectReason>,
}

impl PeerHandle {
    /// Ask the runner to disconnect. Non-blocking; a second request
    /// while one is pending is dropped.
    pub(crate) fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.disconnect_tx.try_send(reason);
    }

    pub(crate) fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.to_string(),
            name: self.name.clone(),
            caps: self.caps.iter().map(Cap::to_string).collect(),
            network: PeerNetworkInfo {
                remote_address: self.remote_addr.to_string(),
                inbound: self.flags.contains(ConnFlags::INBOUND),
                trusted: self.flags.contains(ConnFlags::TRUSTED),
                static_node: self.flags.contains(ConnFlags::STATIC_DIALED),
            },
        }
    }
}

/// Outcome of a peer runner: the error reason (None for a clean exit)
/// and whether the remote asked for the disconnect.
pub(crate) struct PeerOutcome {
    pub error: Option<DisconnectReason>,
    pub remote_requested: bool,
}

/// The runner side of an admitted peer.
pub(crate) struct Peer {
    pub id: NodeId,
    transport: Box<dyn Transport>,
    disconnect_rx: mpsc::Receiver<DisconnectReason>,
    protos: Vec<MatchedProto>,
    events: Option<broadcast::Sender<PeerEvent>>,
}

impl Peer {
    /// Promote an admitted connection. Returns the runner-side peer and
    /// the handle the coordinator keeps in the map.
    pub(crate) fn promote(
        conn: Conn,
        protocols: &[Arc<dyn Protocol>],
        msg_events: Option<broadcast::Sender<PeerEvent>>,
    ) -> (Self, PeerHandle) {
        let protos = match_protocols(protocols, &conn.caps);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let handle = PeerHandle {
            id: conn.id,
            name: conn.name.clone(),
            caps: conn.caps.clone(),
            flags: conn.flags,
            remote_addr: conn.remote_addr,
            created: Instant::now(),
            disconnect_tx,
        };
        let peer = Self {
            id: conn.id,
            transport: conn.transport,
            disconnect_rx,
            protos,
            events: msg_events,
        };
        (peer, handle)
    }

    fn emit_msg(&self, kind: PeerEventKind, code: u8) {
        if code < BASE_PROTOCOL_LENGTH {
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(PeerEvent::msg(kind, self.id, code));
        }
    }

    /// Drive the peer until a disconnect, a transport failure, or all
    /// sub-protocol runners return.
    pub(crate) async fn run(mut self) -> PeerOutcome {
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(16);
        let mut routes: Vec<(u8, u8, mpsc::Sender<ProtoMsg>)> = Vec::new();
        let mut runners: JoinSet<Result<(), DisconnectReason>> = JoinSet::new();

        for m in self.protos.drain(..) {
            let (in_tx, in_rx) = mpsc::channel(64);
            let len = m.proto.msg_count();
            routes.push((m.offset, len, in_tx));
            let proto_peer = ProtoPeer {
                remote_id: self.id,
                cap: m.cap,
                rx: in_rx,
                tx: ProtoSender {
                    outbound: out_tx.clone(),
                    offset: m.offset,
                    len,
                },
            };
            let proto = m.proto;
            runners.spawn(async move { proto.run(proto_peer).await });
        }
        drop(out_tx);

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // arm without firing immediately

        enum Event {
            Disc(Option<DisconnectReason>),
            Out(Option<Frame>),
            In(Result<Frame, crate::transport::TransportError>),
            ProtoDone(Option<Result<(), DisconnectReason>>),
            Ping,
        }

        // With no sub-protocols configured the peer idles on base
        // pings; "all runners returned" only ends a peer that had some.
        let had_protos = !routes.is_empty();
        let mut out_open = true;
        let outcome = loop {
            let ev = tokio::select! {
                m = self.disconnect_rx.recv() => Event::Disc(m),
                m = out_rx.recv(), if out_open => Event::Out(m),
                r = self.transport.read_frame() => Event::In(r),
                r = runners.join_next(), if !runners.is_empty() => Event::ProtoDone(r.map(|j| j.unwrap_or(Err(DisconnectReason::Other)))),
                _ = ping.tick() => Event::Ping,
            };

            match ev {
                Event::Disc(reason) => {
                    let reason = reason.unwrap_or(DisconnectReason::Requested);
                    self.transport.close(Some(reason)).await;
                    break PeerOutcome {
                        error: Some(reason),
                        remote_requested: false,
                    };
                }
                Event::Out(Some(frame)) => {
                    let code = frame.code;
                    if let Err(e) = self.transport.write_frame(frame).await {
                        debug!(peer = ?self.id, "peer write failed: {e}");
                        self.transport.close(None).await;
                        break PeerOutcome {
                            error: Some(e.disconnect_reason()),
                            remote_requested: false,
                        };
                    }
                    self.emit_msg(PeerEventKind::MsgSend, code);
                }
                Event::Out(None) => {
                    // All protocol senders dropped; runner results are
                    // collected via ProtoDone.
                    out_open = false;
                    if had_protos && runners.is_empty() {
                        self.transport.close(Some(DisconnectReason::Requested)).await;
                        break PeerOutcome {
                            error: None,
                            remote_requested: false,
                        };
                    }
                }
                Event::In(Err(e)) => {
                    let reason = e.disconnect_reason();
                    trace!(peer = ?self.id, "peer read failed: {e}");
                    self.transport.close(Some(reason)).await;
                    break PeerOutcome {
                        error: Some(reason),
                        remote_requested: false,
                    };
                }
                Event::In(Ok(frame)) if frame.code == base_msg::DISCONNECT => {
                    let reason = frame
                        .data
                        .first()
                        .map(|b| DisconnectReason::from_code(*b))
                        .unwrap_or(DisconnectReason::Other);
                    self.transport.close(None).await;
                    break PeerOutcome {
                        error: Some(reason),
                        remote_requested: reason == DisconnectReason::Requested,
                    };
                }
                Event::In(Ok(frame)) if frame.code == base_msg::PING => {
                    if self
                        .transport
                        .write_frame(Frame::new(base_msg::PONG, Bytes::new()))
                        .await
                        .is_err()
                    {
                        self.transport.close(None).await;
                        break PeerOutcome {
                            error: Some(DisconnectReason::TcpError),
                            remote_requested: false,
                        };
                    }
                }
                Event::In(Ok(frame)) if frame.code == base_msg::PONG => {}
                Event::In(Ok(frame)) => {
                    let route = routes
                        .iter()
                        .find(|(off, len, _)| frame.code >= *off && frame.code < off.saturating_add(*len));
                    match route {
                        Some((off, _, in_tx)) => {
                            self.emit_msg(PeerEventKind::MsgRecv, frame.code);
                            let msg = ProtoMsg {
                                code: frame.code - off,
                                data: frame.data,
                            };
                            // Backpressure: a slow protocol stalls its peer.
                            if in_tx.send(msg).await.is_err() {
                                trace!(peer = ?self.id, "protocol runner gone, dropping frame");
                            }
                        }
                        None => {
                            self.transport
                                .close(Some(DisconnectReason::ProtocolBreach))
                                .await;
                            break PeerOutcome {
                                error: Some(DisconnectReason::ProtocolBreach),
                                remote_requested: false,
                            };
                        }
                    }
                }
                Event::ProtoDone(Some(Err(reason))) => {
                    self.transport.close(Some(reason)).await;
                    break PeerOutcome {
                        error: Some(reason),
                        remote_requested: false,
                    };
                }
                Event::ProtoDone(Some(Ok(()))) => {
                    if had_protos && runners.is_empty() {
                        self.transport.close(Some(DisconnectReason::Requested)).await;
                        break PeerOutcome {
                            error: None,
                            remote_requested: false,
                        };
                    }
                }
                Event::ProtoDone(None) => {}
                Event::Ping => {
                    if self
                        .transport
                        .write_frame(Frame::new(base_msg::PING, Bytes::new()))
                        .await
                        .is_err()
                    {
                        self.transport.close(None).await;
                        break PeerOutcome {
                            error: Some(DisconnectReason::TcpError),
                            remote_requested: false,
                        };
                    }
                }
            }
        };

        runners.abort_all();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        name: &'static str,
        version: u32,
        count: u8,
    }

    #[async_trait]
    impl Protocol for Dummy {
        fn name(&self) -> &str {
            self.name
        }
        fn version(&self) -> u32 {
            self.version
        }
        fn msg_count(&self) -> u8 {
            self.count
        }
        async fn run(&self, _peer: ProtoPeer) -> Result<(), DisconnectReason> {
            Ok(())
        }
    }

    fn proto(name: &'static str, version: u32, count: u8) -> Arc<dyn Protocol> {
        Arc::new(Dummy {
            name,
            version,
            count,
        })
    }

    #[test]
    fn matching_picks_highest_shared_version() {
        let ours = vec![proto("mesh", 1, 4), proto("mesh", 2, 4)];
        let theirs = vec![Cap::new("mesh", 1), Cap::new("mesh", 2)];
        let matched = match_protocols(&ours, &theirs);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].cap, Cap::new("mesh", 2));
    }

    #[test]
    fn offsets_stack_in_name_order_above_base_range() {
        let ours = vec![proto("sync", 1, 8), proto("mesh", 1, 4)];
        let theirs = vec![Cap::new("mesh", 1), Cap::new("sync", 1)];
        let matched = match_protocols(&ours, &theirs);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].cap.name, "mesh");
        assert_eq!(matched[0].offset, BASE_PROTOCOL_LENGTH);
        assert_eq!(matched[1].cap.name, "sync");
        assert_eq!(matched[1].offset, BASE_PROTOCOL_LENGTH + 4);
    }

    #[test]
    fn unshared_caps_do_not_match() {
        let ours = vec![proto("mesh", 2, 4)];
        let theirs = vec![Cap::new("mesh", 1)];
        assert!(match_protocols(&ours, &theirs).is_empty());
    }

    #[tokio::test]
    async fn proto_sender_rejects_out_of_range_codes() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = ProtoSender {
            outbound: tx,
            offset: 16,
            len: 4,
        };
        assert!(sender.send(3, Bytes::new()).await.is_ok());
        assert!(sender.send(4, Bytes::new()).await.is_err());
    }
}
