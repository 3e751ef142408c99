//! Discovery-table contract.
//!
//! Node discovery itself (UDP lookups) is an external collaborator; the
//! engine talks to it only through [`DiscoveryTable`]. [`MemoryDiscovery`]
//! is a process-local implementation for manual topologies and tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use trellis_common::{Node, NodeId};

/// The discovery table the dial scheduler draws candidates from.
#[async_trait]
pub trait DiscoveryTable: Send + Sync {
    /// The local node's endpoint as the table advertises it.
    fn self_node(&self) -> Node;

    /// Seed the table with bootstrap nodes.
    async fn set_fallback_nodes(&self, nodes: &[Node]);

    /// Look up the endpoint for a known identifier.
    async fn resolve(&self, id: NodeId) -> Option<Node>;

    /// Perform a random lookup and return fresh candidates.
    async fn lookup_random(&self) -> Vec<Node>;

    /// Release table resources. Called once during shutdown.
    fn close(&self);
}

/// An in-process discovery table backed by a fixed candidate queue.
///
/// `lookup_random` rotates through the queue so repeated lookups keep
/// yielding candidates.
pub struct MemoryDiscovery {
    self_node: Node,
    candidates: Mutex<VecDeque<Node>>,
    batch: usize,
}

impl MemoryDiscovery {
    /// Build a table advertising `self_node` and serving `candidates`.
    #[must_use]
    pub fn new(self_node: Node, candidates: Vec<Node>) -> Self {
        Self {
            self_node,
            candidates: Mutex::new(candidates.into()),
            batch: 8,
        }
    }

    /// Append a candidate to the queue.
    pub fn push(&self, node: Node) {
        self.candidates.lock().expect("poisoned").push_back(node);
    }
}

#[async_trait]
impl DiscoveryTable for MemoryDiscovery {
    fn self_node(&self) -> Node {
        self.self_node
    }

    async fn set_fallback_nodes(&self, nodes: &[Node]) {
        let mut q = self.candidates.lock().expect("poisoned");
        for n in nodes {
            if !q.contains(n) {
                q.push_back(*n);
            }
        }
    }

    async fn resolve(&self, id: NodeId) -> Option<Node> {
        let q = self.candidates.lock().expect("poisoned");
        q.iter().find(|n| n.id == id).copied()
    }

    async fn lookup_random(&self) -> Vec<Node> {
        let mut q = self.candidates.lock().expect("poisoned");
        let take = self.batch.min(q.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(n) = q.pop_front() {
                out.push(n);
                q.push_back(n);
            }
        }
        out
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::node::NODE_ID_LEN;

    fn node(byte: u8) -> Node {
        Node::new(
            NodeId::new([byte; NODE_ID_LEN]),
            "127.0.0.1".parse().unwrap(),
            30000 + u16::from(byte),
        )
    }

    #[tokio::test]
    async fn lookup_rotates_through_candidates() {
        let table = MemoryDiscovery::new(node(0), vec![node(1), node(2)]);
        let first = table.lookup_random().await;
        let second = table.lookup_random().await;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn resolve_finds_candidates_by_id() {
        let table = MemoryDiscovery::new(node(0), vec![node(1)]);
        assert_eq!(table.resolve(node(1).id).await, Some(node(1)));
        assert_eq!(table.resolve(node(9).id).await, None);
    }

    #[tokio::test]
    async fn fallback_nodes_are_deduplicated() {
        let table = MemoryDiscovery::new(node(0), vec![node(1)]);
        table.set_fallback_nodes(&[node(1), node(2)]).await;
        let all = table.lookup_random().await;
        assert_eq!(all.len(), 2);
    }
}
