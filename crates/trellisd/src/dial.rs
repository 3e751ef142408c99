//! Dial scheduler: proposes outbound work to the coordinator.
//!
//! The scheduler is plain state driven entirely by the coordinator
//! loop. It prioritises static nodes, fills the remaining dynamic
//! target from discovery candidates, enforces per-destination redial
//! cooldowns, and replenishes the candidate pool with lookup tasks.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::trace;
use trellis_common::{Netlist, Node, NodeId};

use crate::conn::ConnFlags;
use crate::peer::PeerHandle;

/// Default for how long a destination stays off-limits after a
/// completed dial. Keeps failing nodes from being hammered in a hot
/// loop.
pub(crate) const DIAL_HISTORY_EXPIRATION: Duration = Duration::from_secs(30);

/// A unit of outbound work, run on a worker and posted back on
/// `taskdone` when it completes.
#[derive(Debug)]
pub(crate) enum Task {
    /// Connect to a specific node and run the handshake pipeline.
    Dial {
        flags: ConnFlags,
        dest: Node,
    },
    /// Refresh the candidate pool with a random lookup. `results` is
    /// filled in by the worker before the task is posted back.
    Discover {
        results: Vec<Node>,
    },
}

/// Why a candidate was skipped this round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DialSkip {
    SelfNode,
    Connected,
    Dialing,
    Cooldown,
    NotAllowed,
    Denied,
}

pub(crate) struct DialState {
    max_dyn_dials: usize,
    local_id: NodeId,
    no_dial: bool,
    has_discovery: bool,
    net_restrict: Option<Netlist>,
    deny_list: Option<Netlist>,
    cooldown: Duration,
    statics: HashMap<NodeId, Node>,
    dialing: HashMap<NodeId, ConnFlags>,
    lookup_buf: VecDeque<Node>,
    lookup_running: bool,
    hist: HashMap<NodeId, Instant>,
}

impl DialState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        static_nodes: &[Node],
        max_dyn_dials: usize,
        local_id: NodeId,
        no_dial: bool,
        has_discovery: bool,
        net_restrict: Option<Netlist>,
        deny_list: Option<Netlist>,
        cooldown: Duration,
    ) -> Self {
        Self {
            max_dyn_dials,
            local_id,
            no_dial,
            has_discovery,
            net_restrict,
            deny_list,
            cooldown,
            statics: static_nodes.iter().map(|n| (n.id, *n)).collect(),
            dialing: HashMap::new(),
            lookup_buf: VecDeque::new(),
            lookup_running: false,
            hist: HashMap::new(),
        }
    }

    pub(crate) fn add_static(&mut self, node: Node) {
        self.statics.insert(node.id, node);
    }

    /// Remove a node from the static set. Its dial history is cleared
    /// so a later re-add connects without waiting out the cooldown.
    pub(crate) fn remove_static(&mut self, id: &NodeId) {
        self.statics.remove(id);
        self.hist.remove(id);
    }

    /// Propose new tasks given the number of tasks already in flight or
    /// queued and the current peer map.
    pub(crate) fn new_tasks(
        &mut self,
        n_running: usize,
        peers: &HashMap<NodeId, PeerHandle>,
        now: Instant,
    ) -> Vec<Task> {
        if self.no_dial {
            return Vec::new();
        }
        self.hist.retain(|_, expiry| *expiry > now);

        let mut need_dynamic = self.max_dyn_dials;
        for p in peers.values() {
            if p.flags.contains(ConnFlags::DYN_DIALED) {
                need_dynamic = need_dynamic.saturating_sub(1);
            }
        }
        for f in self.dialing.values() {
            if f.contains(ConnFlags::DYN_DIALED) {
                need_dynamic = need_dynamic.saturating_sub(1);
            }
        }

        let mut tasks = Vec::new();

        // Static nodes come first, in stable id order.
        let mut statics: Vec<Node> = self.statics.values().copied().collect();
        statics.sort_by_key(|n| n.id);
        for node in statics {
            match self.check_dial(&node, peers) {
                Ok(()) => {
                    self.dialing.insert(node.id, ConnFlags::STATIC_DIALED);
                    tasks.push(Task::Dial {
                        flags: ConnFlags::STATIC_DIALED,
                        dest: node,
                    });
                }
                Err(skip) => trace!(node = %node.id, ?skip, "skipping static dial"),
            }
        }

        // Then dynamic candidates, in first-seen order.
        while need_dynamic > 0 {
            let Some(node) = self.lookup_buf.pop_front() else {
                break;
            };
            match self.check_dial(&node, peers) {
                Ok(()) => {
                    self.dialing.insert(node.id, ConnFlags::DYN_DIALED);
                    tasks.push(Task::Dial {
                        flags: ConnFlags::DYN_DIALED,
                        dest: node,
                    });
                    need_dynamic -= 1;
                }
                Err(skip) => trace!(node = %node.id, ?skip, "skipping candidate"),
            }
        }

        // Replenish the candidate pool before it runs dry.
        if self.has_discovery
            && !self.lookup_running
            && self.lookup_buf.len() < need_dynamic.max(1)
            && need_dynamic > 0
        {
            self.lookup_running = true;
            tasks.push(Task::Discover {
                results: Vec::new(),
            });
        }

        let _ = n_running;
        tasks
    }

    /// Record a completed task: start the destination's cooldown and
    /// merge lookup results into the candidate pool.
    pub(crate) fn task_done(&mut self, task: &Task, now: Instant) {
        match task {
            Task::Dial { dest, .. } => {
                self.hist.insert(dest.id, now + self.cooldown);
                self.dialing.remove(&dest.id);
            }
            Task::Discover { results } => {
                self.lookup_running = false;
                for node in results {
                    if !self.lookup_buf.iter().any(|n| n.id == node.id) {
                        self.lookup_buf.push_back(*node);
                    }
                }
            }
        }
    }

    /// The next instant at which an expiring cooldown could unblock a
    /// dial. The coordinator arms a wakeup for it so static redials
    /// happen without waiting for unrelated traffic.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.hist.values().min().copied()
    }

    fn check_dial(&self, node: &Node, peers: &HashMap<NodeId, PeerHandle>) -> Result<(), DialSkip> {
        if self.dialing.contains_key(&node.id) {
            return Err(DialSkip::Dialing);
        }
        if peers.contains_key(&node.id) {
            return Err(DialSkip::Connected);
        }
        // Only discovery knows our advertised identity; without it the
        // self check is left to gate 1.
        if self.has_discovery && node.id == self.local_id {
            return Err(DialSkip::SelfNode);
        }
        if let Some(allow) = &self.net_restrict {
            if !allow.contains(node.ip) {
                return Err(DialSkip::NotAllowed);
            }
        }
        if let Some(deny) = &self.deny_list {
            if deny.contains(node.ip) {
                return Err(DialSkip::Denied);
            }
        }
        if self.hist.contains_key(&node.id) {
            return Err(DialSkip::Cooldown);
        }
        Ok(())
    }
}
