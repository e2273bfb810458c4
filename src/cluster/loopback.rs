//! In-process cluster network
//!
//! Connects nodes living in the same process with in-memory channels. Each
//! connect emits node-up on both ends with a fresh channel pair; each
//! disconnect emits node-down on both ends. Used by the demo binary and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClusterEvent, FailureAdapter, PeerChannel};
use crate::types::NodeId;

#[derive(Debug, Default)]
struct LoopbackState {
    nodes: HashMap<NodeId, mpsc::UnboundedSender<ClusterEvent>>,
    links: BTreeSet<(NodeId, NodeId)>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Shared handle to an in-process network
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return the event source for it
    pub fn add_node(&self, node: NodeId) -> LoopbackAdapter {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().nodes.insert(node, tx);
        LoopbackAdapter { node, events: rx }
    }

    /// Disconnect `node` from everyone and stop its event stream
    pub fn remove_node(&self, node: NodeId) {
        let peers = self.peers_of(node);
        for peer in peers {
            self.disconnect(node, peer);
        }
        self.state.lock().nodes.remove(&node);
    }

    /// Open a connection between `a` and `b`.
    /// Returns false if either node is unknown or they are already connected.
    pub fn connect(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return false;
        }
        let mut state = self.state.lock();
        if state.links.contains(&link(a, b)) {
            return false;
        }
        let (Some(a_events), Some(b_events)) = (state.nodes.get(&a), state.nodes.get(&b)) else {
            return false;
        };

        let (a_end, b_end) = PeerChannel::pair(a, b);
        let _ = a_events.send(ClusterEvent::NodeUp { node: b, channel: a_end });
        let _ = b_events.send(ClusterEvent::NodeUp { node: a, channel: b_end });
        state.links.insert(link(a, b));
        debug!(a = %a.short(), b = %b.short(), "loopback link up");
        true
    }

    /// Tear down the connection between `a` and `b`
    pub fn disconnect(&self, a: NodeId, b: NodeId) -> bool {
        let mut state = self.state.lock();
        if !state.links.remove(&link(a, b)) {
            return false;
        }
        if let Some(events) = state.nodes.get(&a) {
            let _ = events.send(ClusterEvent::NodeDown { node: b });
        }
        if let Some(events) = state.nodes.get(&b) {
            let _ = events.send(ClusterEvent::NodeDown { node: a });
        }
        debug!(a = %a.short(), b = %b.short(), "loopback link down");
        true
    }

    /// Connect every pair of registered nodes
    pub fn connect_all(&self) {
        let mut nodes: Vec<NodeId> = self.state.lock().nodes.keys().copied().collect();
        nodes.sort();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                self.connect(*a, *b);
            }
        }
    }

    /// Cut every link between the two sides
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.disconnect(*a, *b);
            }
        }
    }

    /// Reconnect every pair across the two sides
    pub fn heal(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.connect(*a, *b);
            }
        }
    }

    pub fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.state.lock().links.contains(&link(a, b))
    }

    /// Nodes currently connected to `node`
    pub fn peers_of(&self, node: NodeId) -> Vec<NodeId> {
        self.state
            .lock()
            .links
            .iter()
            .filter_map(|&(a, b)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Event source for one node of a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackAdapter {
    node: NodeId,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
}

impl LoopbackAdapter {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

#[async_trait]
impl FailureAdapter for LoopbackAdapter {
    async fn next_event(&mut self) -> Option<ClusterEvent> {
        self.events.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_connect_emits_node_up_on_both_ends() {
        let net = LoopbackNetwork::new();
        let a = NodeId::new();
        let b = NodeId::new();
        let mut a_events = net.add_node(a);
        let mut b_events = net.add_node(b);

        assert!(net.connect(a, b));
        assert!(!net.connect(b, a));

        let Some(ClusterEvent::NodeUp { node, channel: a_end }) = a_events.next_event().await else {
            panic!("expected node-up on a");
        };
        assert_eq!(node, b);
        let Some(ClusterEvent::NodeUp { node, channel: mut b_end }) = b_events.next_event().await else {
            panic!("expected node-up on b");
        };
        assert_eq!(node, a);

        a_end.sender.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(b_end.receiver.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_partition_emits_node_down() {
        let net = LoopbackNetwork::new();
        let a = NodeId::new();
        let b = NodeId::new();
        let mut a_events = net.add_node(a);
        let _b_events = net.add_node(b);

        net.connect_all();
        assert!(net.is_connected(a, b));
        net.partition(&[a], &[b]);
        assert!(!net.is_connected(a, b));
        assert!(net.peers_of(a).is_empty());

        assert!(matches!(a_events.next_event().await, Some(ClusterEvent::NodeUp { .. })));
        assert!(matches!(a_events.next_event().await, Some(ClusterEvent::NodeDown { node }) if node == b));
    }
}
