//! The connection lifecycle engine: accept loop, handshake pipeline,
//! and the coordinator that owns the peer map.
//!
//! The coordinator is the only task that reads or writes the peer map.
//! Everything else — the acceptor, dial workers, handshake runners,
//! peer runners, and the public control API — talks to it over
//! channels. Handshake runners checkpoint twice: once after the
//! encryption handshake (identity known) and once after the protocol
//! handshake (capabilities known); both gates re-run admission against
//! the live map.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use trellis_common::{caps, Cap, DisconnectReason, Node, NodeId};

use crate::config::Config;
use crate::conn::{AddPeerMsg, Conn, ConnFlags, PostHandshakeMsg};
use crate::dial::{DialState, Task};
use crate::error::ServerError;
use crate::events::PeerEvent;
use crate::metrics::{counters, gauges};
use crate::peer::{proto_cap, Peer, PeerHandle, PeerInfo};
use crate::persist::{self, KnownNodeRecord, NodeObservation};
use crate::transport::{
    AsyncStream, Dialer, FramedFactory, Hello, MeteredStream, NatMapper, TcpDialer,
    TransportError, TransportFactory, BASE_PROTOCOL_VERSION,
};

/// Capacity of the event feed.
const EVENT_CAPACITY: usize = 256;
/// NAT mapping lease requested from the port mapper.
const NAT_LEASE: Duration = Duration::from_secs(20 * 60);
/// How often the NAT mapping is renewed.
const NAT_REFRESH: Duration = Duration::from_secs(15 * 60);

/// Read-only closure served by the coordinator against the peer map.
pub(crate) type PeerOp = Box<dyn FnOnce(&HashMap<NodeId, PeerHandle>) + Send>;

/// Report from a finished peer runner.
pub(crate) struct PeerDrop {
    pub id: NodeId,
    pub created: Instant,
    pub error: Option<DisconnectReason>,
    pub requested: bool,
}

/// Sender half of the coordinator's channels, shared by all tasks.
pub(crate) struct Channels {
    pub add_static: mpsc::Sender<Node>,
    pub remove_static: mpsc::Sender<Node>,
    pub peer_op: mpsc::Sender<PeerOp>,
    pub posthandshake: mpsc::Sender<PostHandshakeMsg>,
    pub addpeer: mpsc::Sender<AddPeerMsg>,
    pub delpeer: mpsc::Sender<PeerDrop>,
    pub taskdone: mpsc::Sender<Task>,
}

/// Receiver half, taken by the coordinator at start.
struct CoordInbox {
    add_static: mpsc::Receiver<Node>,
    remove_static: mpsc::Receiver<Node>,
    peer_op: mpsc::Receiver<PeerOp>,
    posthandshake: mpsc::Receiver<PostHandshakeMsg>,
    addpeer: mpsc::Receiver<AddPeerMsg>,
    delpeer: mpsc::Receiver<PeerDrop>,
    taskdone: mpsc::Receiver<Task>,
}

/// State shared between the coordinator, the acceptor, dial workers,
/// and handshake runners.
pub(crate) struct ServerState {
    pub config: Config,
    pub local_id: NodeId,
    pub transport: Arc<dyn TransportFactory>,
    pub dialer: Arc<dyn Dialer>,
    pub chans: Channels,
    pub quit: CancellationToken,
    /// Read by handshake runners to refuse work after stop.
    pub running: Mutex<bool>,
    pub our_hello: OnceLock<Hello>,
    pub listen_addr: Mutex<Option<SocketAddr>>,
    pub known_nodes: DashMap<NodeId, KnownNodeRecord>,
    pub events: broadcast::Sender<PeerEvent>,
}

/// Manages the live population of authenticated peer connections.
pub struct Server {
    state: Arc<ServerState>,
    inbox: Mutex<Option<CoordInbox>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Build a server from a configuration. Nothing runs until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (add_static_tx, add_static_rx) = mpsc::channel(1);
        let (remove_static_tx, remove_static_rx) = mpsc::channel(1);
        let (peer_op_tx, peer_op_rx) = mpsc::channel(1);
        let (posthandshake_tx, posthandshake_rx) = mpsc::channel(1);
        let (addpeer_tx, addpeer_rx) = mpsc::channel(1);
        let (delpeer_tx, delpeer_rx) = mpsc::channel(1);
        // Sized to the dial cap so completing tasks never block on a
        // momentarily busy coordinator.
        let (taskdone_tx, taskdone_rx) = mpsc::channel(config.max_dial.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let local_id = config.secret_key.node_id();
        let transport = config
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(FramedFactory));
        let dialer = config
            .dialer
            .clone()
            .unwrap_or_else(|| Arc::new(TcpDialer::default()));

        Self {
            state: Arc::new(ServerState {
                config,
                local_id,
                transport,
                dialer,
                chans: Channels {
                    add_static: add_static_tx,
                    remove_static: remove_static_tx,
                    peer_op: peer_op_tx,
                    posthandshake: posthandshake_tx,
                    addpeer: addpeer_tx,
                    delpeer: delpeer_tx,
                    taskdone: taskdone_tx,
                },
                quit: CancellationToken::new(),
                running: Mutex::new(false),
                our_hello: OnceLock::new(),
                listen_addr: Mutex::new(None),
                known_nodes: DashMap::new(),
                events,
            }),
            inbox: Mutex::new(Some(CoordInbox {
                add_static: add_static_rx,
                remove_static: remove_static_rx,
                peer_op: peer_op_rx,
                posthandshake: posthandshake_rx,
                addpeer: addpeer_rx,
                delpeer: delpeer_rx,
                taskdone: taskdone_rx,
            })),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The local node identifier.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.state.local_id
    }

    /// The actual listener address once bound.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.state.listen_addr.lock().expect("poisoned")
    }

    /// Start the server: open the sink, warm the known-node cache, seed
    /// discovery, bind the listener, and launch the coordinator.
    ///
    /// Servers cannot be reused after stopping.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] on a second start,
    /// [`ServerError::Config`] for invalid configuration, and I/O or
    /// sink errors from binding and cache loading. On error the server
    /// does not transition to running.
    pub async fn start(&self) -> Result<(), ServerError> {
        let inbox = self
            .inbox
            .lock()
            .expect("poisoned")
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        self.state
            .config
            .validate()
            .map_err(ServerError::Config)?;

        let config = &self.state.config;
        if let Some(sink) = &config.sink {
            sink.open()?;
            for (id, record) in sink.load_known()? {
                self.state.known_nodes.insert(id, record);
            }
        }

        info!(id = ?self.state.local_id, "starting trellis networking");

        let discovery_enabled = !config.no_discovery && config.discovery.is_some();
        if discovery_enabled {
            if let Some(discovery) = &config.discovery {
                discovery.set_fallback_nodes(&config.bootstrap_nodes).await;
            }
        }

        let mut handles = Vec::new();
        let mut listen_port = 0u16;
        let listener = match config.listen_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                listen_port = local.port();
                *self.state.listen_addr.lock().expect("poisoned") = Some(local);
                Some(listener)
            }
            None => None,
        };

        let hello = Hello {
            version: BASE_PROTOCOL_VERSION,
            name: config.name.clone(),
            caps: config.protocols.iter().map(|p| proto_cap(p.as_ref())).collect(),
            listen_port,
            id: self.state.local_id,
        };
        let _ = self.state.our_hello.set(hello);

        if config.no_dial && config.listen_addr.is_none() {
            warn!("node will be useless, neither dialing nor listening");
        }

        // The flag goes up before the loops spawn so that handshake
        // runners started by them observe a running server.
        *self.state.running.lock().expect("poisoned") = true;

        if let Some(listener) = listener {
            let state = self.state.clone();
            handles.push(tokio::spawn(listen_loop(state, listener)));

            if let (Some(nat), Some(addr)) = (&config.nat, self.listen_addr()) {
                if !addr.ip().is_loopback() {
                    let state = self.state.clone();
                    handles.push(tokio::spawn(nat_loop(state, nat.clone(), addr.port())));
                }
            }
        }

        let dial_state = DialState::new(
            &config.static_nodes,
            config.dyn_dial_target(),
            self.state.local_id,
            config.no_dial,
            discovery_enabled,
            config.net_restrict.clone(),
            config.deny_list.clone(),
            config.dial_cooldown,
        );
        handles.push(tokio::spawn(run_loop(self.state.clone(), inbox, dial_state)));

        *self.handles.lock().expect("poisoned") = handles;
        Ok(())
    }

    /// Stop the server and block until the coordinator, the listener,
    /// and all peer runners have finished.
    pub async fn stop(&self) {
        {
            let mut running = self.state.running.lock().expect("poisoned");
            if !*running {
                return;
            }
            *running = false;
        }
        self.state.quit.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().expect("poisoned"));
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(sink) = &self.state.config.sink {
            if let Err(e) = sink.close() {
                warn!("failed to close node sink: {e}");
            }
        }
    }

    /// Add a node to the static set; the dial scheduler keeps it
    /// connected until it is removed.
    pub async fn add_peer(&self, node: Node) {
        let chans = &self.state.chans;
        tokio::select! {
            _ = self.state.quit.cancelled() => {}
            _ = chans.add_static.send(node) => {}
        }
    }

    /// Remove a node from the static set and disconnect any current
    /// peer with its identifier.
    pub async fn remove_peer(&self, node: Node) {
        let chans = &self.state.chans;
        tokio::select! {
            _ = self.state.quit.cancelled() => {}
            _ = chans.remove_static.send(node) => {}
        }
    }

    /// Snapshot of all connected peers. Returns empty during shutdown
    /// without blocking.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peer_op(|peers| peers.values().map(PeerHandle::info).collect())
            .await
            .unwrap_or_default()
    }

    /// Number of connected peers. Returns zero during shutdown without
    /// blocking.
    pub async fn peer_count(&self) -> usize {
        self.peer_op(|peers| peers.len()).await.unwrap_or(0)
    }

    async fn peer_op<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&HashMap<NodeId, PeerHandle>) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let op: PeerOp = Box::new(move |peers| {
            let _ = tx.send(f(peers));
        });
        tokio::select! {
            _ = self.state.quit.cancelled() => None,
            res = self.state.chans.peer_op.send(op) => {
                if res.is_err() {
                    return None;
                }
                rx.await.ok()
            }
        }
    }

    /// The local node's endpoint: the discovery table's view when
    /// available, otherwise assembled from the listener. A zeroed node
    /// when not running.
    #[must_use]
    pub fn self_node(&self) -> Node {
        if !*self.state.running.lock().expect("poisoned") {
            return Node::zero();
        }
        if let Some(discovery) = &self.state.config.discovery {
            if !self.state.config.no_discovery {
                return discovery.self_node();
            }
        }
        match self.listen_addr() {
            Some(addr) => Node::new(self.state.local_id, addr.ip(), addr.port()),
            None => Node {
                id: self.state.local_id,
                ..Node::zero()
            },
        }
    }

    /// Subscribe to peer add/drop (and, when enabled, per-message)
    /// events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.state.events.subscribe()
    }

    /// Metadata summary of the local node.
    #[must_use]
    pub fn node_info(&self) -> NodeInfo {
        let node = self.self_node();
        let mut protocols = BTreeMap::new();
        for proto in &self.state.config.protocols {
            protocols
                .entry(proto.name().to_string())
                .or_insert_with(|| {
                    proto
                        .node_info()
                        .unwrap_or_else(|| serde_json::Value::String("unknown".into()))
                });
        }
        NodeInfo {
            id: node.id.to_string(),
            name: self.state.config.name.clone(),
            url: node.to_string(),
            ip: node.ip.to_string(),
            ports: NodePorts {
                discovery: node.udp,
                listener: node.tcp,
            },
            listen_addr: self.listen_addr().map(|a| a.to_string()).unwrap_or_default(),
            protocols,
        }
    }

    /// Per-peer metadata, sorted ascending by identifier.
    pub async fn peers_info(&self) -> Vec<PeerInfo> {
        let mut infos = self.peers().await;
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Everything observed about nodes ever seen, sorted ascending by
    /// identifier.
    #[must_use]
    pub fn known_nodes(&self) -> Vec<KnownNodeEntry> {
        let mut entries: Vec<KnownNodeEntry> = self
            .state
            .known_nodes
            .iter()
            .map(|e| KnownNodeEntry {
                node_id: e.key().to_string(),
                info: e.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
    }
}

/// Summary of the information known about the local node.
#[derive(Clone, Debug, Serialize)]
pub struct NodeInfo {
    /// Hex identifier.
    pub id: String,
    /// Configured client name.
    pub name: String,
    /// URL for adding this node from remote peers.
    pub url: String,
    /// Advertised IP address.
    pub ip: String,
    /// Listening ports.
    pub ports: NodePorts,
    /// Actual listener address.
    #[serde(rename = "listenAddr")]
    pub listen_addr: String,
    /// Per-protocol metadata.
    pub protocols: BTreeMap<String, serde_json::Value>,
}

/// UDP/TCP listening ports of the local node.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct NodePorts {
    /// UDP discovery port.
    pub discovery: u16,
    /// TCP listener port.
    pub listener: u16,
}

/// One entry of the known-node report.
#[derive(Clone, Debug, Serialize)]
pub struct KnownNodeEntry {
    /// Hex identifier.
    #[serde(rename = "nodeId")]
    pub node_id: String,
    /// Latest cached observation.
    pub info: KnownNodeRecord,
}

// ---------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------

async fn run_loop(state: Arc<ServerState>, mut inbox: CoordInbox, mut dial_state: DialState) {
    let mut peers: HashMap<NodeId, PeerHandle> = HashMap::new();
    let trusted: HashSet<NodeId> = state.config.trusted_nodes.iter().map(|n| n.id).collect();
    let mut queued: VecDeque<Task> = VecDeque::new();
    let mut n_running: usize = 0;
    let task_cap = state.config.max_dial;

    'running: loop {
        // Drain the queue first, then ask the scheduler for more.
        while n_running < task_cap {
            let Some(task) = queued.pop_front() else { break };
            spawn_task(&state, task);
            n_running += 1;
        }
        if n_running < task_cap {
            let fresh = dial_state.new_tasks(n_running + queued.len(), &peers, Instant::now());
            queued.extend(fresh);
            while n_running < task_cap {
                let Some(task) = queued.pop_front() else { break };
                spawn_task(&state, task);
                n_running += 1;
            }
        }
        gauges::dial_tasks_running(n_running);

        let wake = dial_state.next_expiry();
        tokio::select! {
            _ = state.quit.cancelled() => break 'running,
            () = async {
                match wake {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            } => {
                // A dial cooldown expired; loop around to reschedule.
            }
            Some(node) = inbox.add_static.recv() => {
                debug!(node = %node.id, "adding static node");
                dial_state.add_static(node);
            }
            Some(node) = inbox.remove_static.recv() => {
                debug!(node = %node.id, "removing static node");
                dial_state.remove_static(&node.id);
                if let Some(peer) = peers.get(&node.id) {
                    peer.disconnect(DisconnectReason::Requested);
                }
            }
            Some(op) = inbox.peer_op.recv() => {
                op(&peers);
            }
            Some(task) = inbox.taskdone.recv() => {
                trace!("dial task done");
                dial_state.task_done(&task, Instant::now());
                n_running = n_running.saturating_sub(1);
            }
            Some(PostHandshakeMsg { mut conn, reply }) = inbox.posthandshake.recv() => {
                // The remote identity is known but not yet verified.
                if trusted.contains(&conn.id) {
                    // The trusted flag must be set before the cap check.
                    conn.flags |= ConnFlags::TRUSTED;
                }
                match enc_handshake_checks(&state.config, &peers, &conn, state.local_id) {
                    Ok(()) => {
                        counters::admissions_total("enc", "admitted");
                        let _ = reply.send(Ok(conn));
                    }
                    Err(reason) => {
                        counters::admissions_total("enc", reason_label(reason));
                        let _ = reply.send(Err((conn, reason)));
                    }
                }
            }
            Some(AddPeerMsg { conn, reply }) = inbox.addpeer.recv() => {
                // Past the protocol handshake: capabilities are known
                // and the identity is verified.
                match proto_handshake_checks(&state.config, &peers, &conn, state.local_id) {
                    Ok(()) => {
                        counters::admissions_total("proto", "admitted");
                        let msg_events = state
                            .config
                            .enable_msg_events
                            .then(|| state.events.clone());
                        let (peer, handle) =
                            Peer::promote(conn, &state.config.protocols, msg_events);
                        info!(
                            id = ?handle.id,
                            name = %truncate_name(&handle.name),
                            addr = %handle.remote_addr,
                            peers = peers.len() + 1,
                            "adding peer"
                        );
                        let id = handle.id;
                        let created = handle.created;
                        peers.insert(id, handle);
                        gauges::inc_peers_active();
                        let _ = state.events.send(PeerEvent::add(id, peers.len()));
                        tokio::spawn(run_peer(state.clone(), peer, created));
                        // The dial scheduler relies on tasks completing
                        // only after the peer is in the map: unblock the
                        // runner last.
                        let _ = reply.send(Ok(()));
                    }
                    Err(reason) => {
                        counters::admissions_total("proto", reason_label(reason));
                        let _ = reply.send(Err((conn, reason)));
                    }
                }
            }
            Some(drop) = inbox.delpeer.recv() => {
                remove_peer(&state, &mut peers, drop);
            }
        }
    }

    trace!("trellis networking is spinning down");

    // Terminate discovery. A running lookup will finish soon.
    if let Some(discovery) = &state.config.discovery {
        discovery.close();
    }
    if let Some(discovery_v5) = &state.config.discovery_v5 {
        discovery_v5.close();
    }
    // Disconnect all peers and wait for them to report back. Pending
    // connections and tasks terminate soon because quit is cancelled.
    for peer in peers.values() {
        peer.disconnect(DisconnectReason::QuittingServer);
    }
    while !peers.is_empty() {
        match inbox.delpeer.recv().await {
            Some(drop) => remove_peer(&state, &mut peers, drop),
            None => break,
        }
    }
}

fn remove_peer(state: &ServerState, peers: &mut HashMap<NodeId, PeerHandle>, drop: PeerDrop) {
    if peers.remove(&drop.id).is_some() {
        debug!(
            id = ?drop.id,
            duration = ?drop.created.elapsed(),
            requested = drop.requested,
            err = drop.error.map(|e| e.to_string()),
            peers = peers.len(),
            "removing peer"
        );
        gauges::dec_peers_active();
        let _ = state.events.send(PeerEvent::drop_(
            drop.id,
            drop.error.map(|e| e.to_string()),
            peers.len(),
        ));
    }
}

fn reason_label(reason: DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::TooManyPeers => "too_many_peers",
        DisconnectReason::AlreadyConnected => "already_connected",
        DisconnectReason::SelfConnect => "self",
        DisconnectReason::UselessPeer => "useless_peer",
        _ => "other",
    }
}

/// Admission checks shared by both gates, in order: peer cap (bypassed
/// by trusted and static-dialed connections), duplicate identifier,
/// self-connection.
fn enc_handshake_checks(
    config: &Config,
    peers: &HashMap<NodeId, PeerHandle>,
    conn: &Conn,
    local_id: NodeId,
) -> Result<(), DisconnectReason> {
    if !conn.is(ConnFlags::TRUSTED | ConnFlags::STATIC_DIALED)
        && !config.no_max_peers
        && peers.len() >= config.max_peers
    {
        return Err(DisconnectReason::TooManyPeers);
    }
    if peers.contains_key(&conn.id) {
        return Err(DisconnectReason::AlreadyConnected);
    }
    if conn.id == local_id {
        return Err(DisconnectReason::SelfConnect);
    }
    Ok(())
}

/// Gate-2 checks: require a shared sub-protocol, then repeat the gate-1
/// checks because the peer set may have changed between the handshakes.
fn proto_handshake_checks(
    config: &Config,
    peers: &HashMap<NodeId, PeerHandle>,
    conn: &Conn,
    local_id: NodeId,
) -> Result<(), DisconnectReason> {
    if !config.protocols.is_empty() {
        let ours: Vec<Cap> = config
            .protocols
            .iter()
            .map(|p| proto_cap(p.as_ref()))
            .collect();
        if caps::count_matching(&ours, &conn.caps) == 0 {
            return Err(DisconnectReason::UselessPeer);
        }
    }
    enc_handshake_checks(config, peers, conn, local_id)
}

fn truncate_name(name: &str) -> String {
    if name.chars().count() > 20 {
        let head: String = name.chars().take(20).collect();
        format!("{head}...")
    } else {
        name.to_string()
    }
}

async fn run_peer(state: Arc<ServerState>, peer: Peer, created: Instant) {
    let id = peer.id;
    let outcome = peer.run().await;

    // The coordinator emits the drop event when it removes the peer
    // from the map. This send must not watch quit: the coordinator
    // drains delpeer while shutting down.
    let _ = state
        .chans
        .delpeer
        .send(PeerDrop {
            id,
            created,
            error: outcome.error,
            requested: outcome.remote_requested,
        })
        .await;
}

// ---------------------------------------------------------------------
// Dial workers
// ---------------------------------------------------------------------

fn spawn_task(state: &Arc<ServerState>, task: Task) {
    let state = state.clone();
    tokio::spawn(async move {
        let task = run_task(task, &state).await;
        let _ = state.chans.taskdone.send(task).await;
    });
}

async fn run_task(task: Task, state: &Arc<ServerState>) -> Task {
    match task {
        Task::Dial { flags, dest } => {
            trace!(node = %dest.id, %flags, "dialing");
            let dialed = tokio::select! {
                _ = state.quit.cancelled() => {
                    counters::dials_total("canceled");
                    return Task::Dial { flags, dest };
                }
                res = state.dialer.dial(&dest) => res,
            };
            match dialed {
                Ok(stream) => {
                    let outcome =
                        setup_conn(state, stream, flags, dest.tcp_addr(), Some(dest)).await;
                    match outcome {
                        Ok(()) => counters::dials_total("ok"),
                        Err(ConnError::Stopped) => counters::dials_total("canceled"),
                        Err(ConnError::Transport(e)) => {
                            trace!(node = %dest.id, "dial handshake failed: {e}");
                            counters::dials_total("error");
                        }
                        Err(ConnError::Rejected(reason)) => {
                            trace!(node = %dest.id, %reason, "dial rejected");
                            counters::dials_total("rejected");
                        }
                    }
                }
                Err(e) => {
                    debug!(node = %dest.id, "dial failed: {e}");
                    counters::dials_total("failed");
                }
            }
            Task::Dial { flags, dest }
        }
        Task::Discover { .. } => {
            let results = match &state.config.discovery {
                Some(discovery) => tokio::select! {
                    _ = state.quit.cancelled() => Vec::new(),
                    nodes = discovery.lookup_random() => nodes,
                },
                None => Vec::new(),
            };
            Task::Discover { results }
        }
    }
}

// ---------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn listen_loop(state: Arc<ServerState>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "listener up");
    }

    // Caps the number of inbound connections lingering pre-admission.
    // The permit is held until the handshake settles.
    let slots = Arc::new(Semaphore::new(state.config.handshake_slots()));

    loop {
        // Wait for a handshake slot before accepting.
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let (stream, remote_addr) = loop {
            tokio::select! {
                _ = state.quit.cancelled() => return,
                res = listener.accept() => match res {
                    Ok(pair) => break pair,
                    Err(e) if is_transient(&e) => {
                        debug!("temporary accept error: {e}");
                        continue;
                    }
                    Err(e) => {
                        debug!("accept error: {e}");
                        return;
                    }
                }
            }
        };
        counters::accepts_total();

        if let Some(allow) = &state.config.net_restrict {
            if !allow.contains(remote_addr.ip()) {
                debug!(addr = %remote_addr, "rejected conn (not in allow list)");
                counters::rejected_addresses_total("not_allowed");
                continue;
            }
        }
        if let Some(deny) = &state.config.deny_list {
            if deny.contains(remote_addr.ip()) {
                info!(addr = %remote_addr.ip(), transport = "tcp", "denied connection");
                counters::rejected_addresses_total("denied");
                continue;
            }
        }

        trace!(addr = %remote_addr, "accepted connection");
        let state = state.clone();
        tokio::spawn(async move {
            // The slot returns when the connection has been admitted or
            // definitively rejected.
            let _ = setup_conn(
                &state,
                Box::new(stream),
                ConnFlags::INBOUND,
                remote_addr,
                None,
            )
            .await;
            drop(permit);
        });
    }
}

// ---------------------------------------------------------------------
// Handshake runner
// ---------------------------------------------------------------------

/// Why a connection never became a peer.
#[derive(Debug)]
pub(crate) enum ConnError {
    /// The server is not running or stopped mid-handshake.
    Stopped,
    /// A handshake failed at the transport level.
    Transport(TransportError),
    /// The coordinator or the runner rejected the connection.
    Rejected(DisconnectReason),
}

/// Run the handshakes and attempt to add the connection as a peer.
/// Returns when the connection has been added or definitively failed.
pub(crate) async fn setup_conn(
    state: &Arc<ServerState>,
    stream: Box<dyn AsyncStream>,
    flags: ConnFlags,
    remote_addr: SocketAddr,
    dial_dest: Option<Node>,
) -> Result<(), ConnError> {
    // Keep leftover pending connections out of the handshake after stop.
    let running = *state.running.lock().expect("poisoned");
    let metered = MeteredStream::new(stream, flags.contains(ConnFlags::INBOUND));
    let transport = state.transport.new_transport(Box::new(metered));
    let mut conn = Conn::new(transport, flags, remote_addr);
    if !running {
        conn.close(None).await;
        return Err(ConnError::Stopped);
    }

    // Phase 1: encryption handshake reveals the remote identifier.
    let dial_dest_id = dial_dest.map(|n| n.id);
    match conn
        .transport
        .do_enc_handshake(&state.config.secret_key, dial_dest_id)
        .await
    {
        Ok(id) => conn.id = id,
        Err(e) => {
            debug!(addr = %remote_addr, conn = %conn.flags, "failed encryption handshake: {e}");
            let reason = e.disconnect_reason();
            conn.close(Some(reason)).await;
            return Err(ConnError::Transport(e));
        }
    }
    // For dialed connections, the remote key must match the target.
    if let Some(want) = dial_dest_id {
        if conn.id != want {
            debug!(got = ?conn.id, want = ?want, "dialed identity mismatch");
            conn.close(Some(DisconnectReason::UnexpectedIdentity)).await;
            return Err(ConnError::Rejected(DisconnectReason::UnexpectedIdentity));
        }
    }

    // Checkpoint 1.
    conn = match checkpoint_enc(state, conn).await? {
        Ok(conn) => conn,
        Err((conn, reason)) => {
            debug!(id = ?conn.id, "rejected peer before protocol handshake: {reason}");
            conn.close(Some(reason)).await;
            return Err(ConnError::Rejected(reason));
        }
    };

    // Phase 2: protocol handshake.
    let Some(our_hello) = state.our_hello.get() else {
        conn.close(None).await;
        return Err(ConnError::Stopped);
    };
    let (remote_hello, received_at) = match conn.transport.do_proto_handshake(our_hello).await {
        Ok(result) => result,
        Err(e) => {
            debug!(id = ?conn.id, "failed protocol handshake: {e}");
            if matches!(
                e,
                TransportError::Disconnected(DisconnectReason::TooManyPeers)
            ) {
                // The remote is full; count it in the node record.
                let (dialed, accepted) = provenance(&conn);
                persist::record_meta(sink(state), &conn.id, dialed, accepted, true);
            }
            let reason = e.disconnect_reason();
            conn.close(Some(reason)).await;
            return Err(ConnError::Transport(e));
        }
    };
    if remote_hello.id != conn.id {
        debug!(claimed = ?remote_hello.id, "wrong protocol handshake identity");
        conn.close(Some(DisconnectReason::UnexpectedIdentity)).await;
        return Err(ConnError::Rejected(DisconnectReason::UnexpectedIdentity));
    }

    store_node_observation(state, &conn, &remote_hello, received_at).await;

    conn.caps = remote_hello.caps;
    conn.name = remote_hello.name;

    // Checkpoint 2. On success the peer runner has been launched.
    match checkpoint_add(state, conn).await? {
        Ok(()) => Ok(()),
        Err((conn, reason)) => {
            debug!(id = ?conn.id, "rejected peer: {reason}");
            conn.close(Some(reason)).await;
            Err(ConnError::Rejected(reason))
        }
    }
}

fn sink(state: &ServerState) -> Option<&dyn crate::persist::NodeSink> {
    state.config.sink.as_deref()
}

fn provenance(conn: &Conn) -> (bool, bool) {
    if conn.is(ConnFlags::INBOUND | ConnFlags::TRUSTED) {
        (false, true)
    } else {
        (true, false)
    }
}

/// Record what the completed handshakes revealed about the node. Runs
/// on the handshake task, never on the coordinator.
async fn store_node_observation(
    state: &Arc<ServerState>,
    conn: &Conn,
    hello: &Hello,
    received_at: chrono::DateTime<chrono::Utc>,
) {
    let (dialed, accepted) = provenance(conn);
    // Inbound source ports are ephemeral; resolve the listening port
    // through discovery when possible. For dialed connections the
    // remote port is the listening port.
    let tcp_port = if accepted {
        match &state.config.discovery {
            Some(discovery) => discovery
                .resolve(conn.id)
                .await
                .map(|n| n.tcp)
                .unwrap_or(0),
            None => 0,
        }
    } else {
        conn.remote_addr.port()
    };

    let caps_joined = hello
        .caps
        .iter()
        .map(Cap::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let observation = NodeObservation {
        last_connected_at: received_at,
        ip: conn.remote_addr.ip(),
        tcp_port,
        remote_port: conn.remote_addr.port(),
        p2p_version: hello.version,
        client_name: hello.name.clone(),
        caps: caps_joined,
        listen_port: hello.listen_port,
    };

    persist::record_meta(sink(state), &conn.id, dialed, accepted, false);
    persist::store_observation(&state.known_nodes, sink(state), conn.id, observation);
}

/// Send the connection to a gate and wait for the admission decision.
/// Both channel operations race against quit.
async fn checkpoint_enc(
    state: &Arc<ServerState>,
    conn: Conn,
) -> Result<crate::conn::GateReply<Conn>, ConnError> {
    let (tx, rx) = oneshot::channel();
    tokio::select! {
        _ = state.quit.cancelled() => return Err(ConnError::Stopped),
        res = state.chans.posthandshake.send(PostHandshakeMsg { conn, reply: tx }) => {
            if res.is_err() {
                return Err(ConnError::Stopped);
            }
        }
    }
    tokio::select! {
        _ = state.quit.cancelled() => Err(ConnError::Stopped),
        reply = rx => reply.map_err(|_| ConnError::Stopped),
    }
}

async fn checkpoint_add(
    state: &Arc<ServerState>,
    conn: Conn,
) -> Result<crate::conn::GateReply<()>, ConnError> {
    let (tx, rx) = oneshot::channel();
    tokio::select! {
        _ = state.quit.cancelled() => return Err(ConnError::Stopped),
        res = state.chans.addpeer.send(AddPeerMsg { conn, reply: tx }) => {
            if res.is_err() {
                return Err(ConnError::Stopped);
            }
        }
    }
    tokio::select! {
        _ = state.quit.cancelled() => Err(ConnError::Stopped),
        reply = rx => reply.map_err(|_| ConnError::Stopped),
    }
}

// ---------------------------------------------------------------------
// NAT
// ---------------------------------------------------------------------

async fn nat_loop(state: Arc<ServerState>, nat: Arc<dyn NatMapper>, port: u16) {
    loop {
        if let Err(e) = nat.map_port("tcp", port, NAT_LEASE).await {
            debug!("nat mapping failed: {e}");
        }
        tokio::select! {
            _ = state.quit.cancelled() => return,
            _ = tokio::time::sleep(NAT_REFRESH) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::node::NODE_ID_LEN;
    use trellis_common::SecretKey;

    fn test_config() -> Config {
        Config::new(SecretKey::from_bytes(&[0x11; 32]).unwrap())
    }

    fn conn_for_checks(flags: ConnFlags, id_byte: u8) -> Conn {
        // The transport is never touched by the admission checks.
        let (a, _b) = tokio::io::duplex(64);
        let transport = FramedFactory.new_transport(Box::new(a));
        let mut conn = Conn::new(transport, flags, "10.0.0.9:4040".parse().unwrap());
        conn.id = NodeId::new([id_byte; NODE_ID_LEN]);
        conn
    }

    fn handle_for(id_byte: u8) -> PeerHandle {
        let (disconnect_tx, _rx) = mpsc::channel(1);
        PeerHandle {
            id: NodeId::new([id_byte; NODE_ID_LEN]),
            name: String::new(),
            caps: Vec::new(),
            flags: ConnFlags::INBOUND,
            remote_addr: "10.0.0.9:4040".parse().unwrap(),
            created: Instant::now(),
            disconnect_tx,
        }
    }

    #[tokio::test]
    async fn cap_check_rejects_when_full() {
        let mut config = test_config();
        config.max_peers = 1;
        let local = config.secret_key.node_id();
        let mut peers = HashMap::new();
        peers.insert(handle_for(1).id, handle_for(1));

        let conn = conn_for_checks(ConnFlags::INBOUND, 2);
        assert_eq!(
            enc_handshake_checks(&config, &peers, &conn, local),
            Err(DisconnectReason::TooManyPeers)
        );
    }

    #[tokio::test]
    async fn trusted_and_static_bypass_the_cap() {
        let mut config = test_config();
        config.max_peers = 1;
        let local = config.secret_key.node_id();
        let mut peers = HashMap::new();
        peers.insert(handle_for(1).id, handle_for(1));

        let trusted = conn_for_checks(ConnFlags::INBOUND | ConnFlags::TRUSTED, 2);
        assert_eq!(enc_handshake_checks(&config, &peers, &trusted, local), Ok(()));
        let static_dialed = conn_for_checks(ConnFlags::STATIC_DIALED, 3);
        assert_eq!(
            enc_handshake_checks(&config, &peers, &static_dialed, local),
            Ok(())
        );
    }

    #[tokio::test]
    async fn duplicate_and_self_are_rejected_in_order() {
        let config = test_config();
        let local = config.secret_key.node_id();
        let mut peers = HashMap::new();
        peers.insert(handle_for(1).id, handle_for(1));

        let dup = conn_for_checks(ConnFlags::INBOUND, 1);
        assert_eq!(
            enc_handshake_checks(&config, &peers, &dup, local),
            Err(DisconnectReason::AlreadyConnected)
        );

        let mut own = conn_for_checks(ConnFlags::INBOUND, 0);
        own.id = local;
        assert_eq!(
            enc_handshake_checks(&config, &peers, &own, local),
            Err(DisconnectReason::SelfConnect)
        );
    }

    #[tokio::test]
    async fn gate_two_requires_a_shared_protocol() {
        use crate::peer::{ProtoPeer, Protocol};
        use async_trait::async_trait;

        struct Mesh;
        #[async_trait]
        impl Protocol for Mesh {
            fn name(&self) -> &str {
                "mesh"
            }
            fn version(&self) -> u32 {
                1
            }
            fn msg_count(&self) -> u8 {
                4
            }
            async fn run(&self, _peer: ProtoPeer) -> Result<(), DisconnectReason> {
                Ok(())
            }
        }

        let mut config = test_config();
        config.protocols = vec![Arc::new(Mesh)];
        let local = config.secret_key.node_id();
        let peers = HashMap::new();

        let mut useless = conn_for_checks(ConnFlags::INBOUND, 2);
        useless.caps = vec![Cap::new("other", 1)];
        assert_eq!(
            proto_handshake_checks(&config, &peers, &useless, local),
            Err(DisconnectReason::UselessPeer)
        );

        let mut useful = conn_for_checks(ConnFlags::INBOUND, 2);
        useful.caps = vec![Cap::new("mesh", 1)];
        assert_eq!(proto_handshake_checks(&config, &peers, &useful, local), Ok(()));
    }

    #[test]
    fn long_names_are_truncated_in_logs() {
        assert_eq!(truncate_name("short"), "short");
        assert_eq!(
            truncate_name("a-very-long-client-name/v1.2.3"),
            "a-very-long-client-n..."
        );
    }

    #[test]
    fn transient_accept_errors_are_recognised() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
