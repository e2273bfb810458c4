//! Cluster transport seam
//!
//! The registry does not discover peers, open connections or detect failures.
//! It consumes those from an external collaborator through [`FailureAdapter`]:
//! an ordered stream of node-up / node-down events, where every node-up hands
//! over a reliable, ordered, bidirectional [`PeerChannel`] to that node.

pub mod loopback;

pub use loopback::{LoopbackAdapter, LoopbackNetwork};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{PgError, PgResult};
use crate::types::NodeId;

/// Outbound half of a peer channel
#[derive(Debug, Clone)]
pub struct PeerSender {
    peer: NodeId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PeerSender {
    pub fn new(peer: NodeId, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { peer, tx }
    }

    /// Node at the other end
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Queue a frame for delivery
    pub fn send(&self, frame: Bytes) -> PgResult<()> {
        self.tx.send(frame).map_err(|_| PgError::ChannelClosed(self.peer))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reliable ordered channel to one connected node
#[derive(Debug)]
pub struct PeerChannel {
    pub sender: PeerSender,
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl PeerChannel {
    /// Cross-wired channel ends for a connection between `a` and `b`.
    /// The first value is `a`'s end (talking to `b`), the second is `b`'s.
    pub fn pair(a: NodeId, b: NodeId) -> (PeerChannel, PeerChannel) {
        let (a_to_b, b_inbox) = mpsc::unbounded_channel();
        let (b_to_a, a_inbox) = mpsc::unbounded_channel();
        (
            PeerChannel { sender: PeerSender::new(b, a_to_b), receiver: a_inbox },
            PeerChannel { sender: PeerSender::new(a, b_to_a), receiver: b_inbox },
        )
    }
}

/// Connectivity change reported by the failure detector
#[derive(Debug)]
pub enum ClusterEvent {
    /// `node` became reachable over `channel`
    NodeUp { node: NodeId, channel: PeerChannel },
    /// `node` is unreachable; its channel must no longer be used
    NodeDown { node: NodeId },
}

impl ClusterEvent {
    pub fn node(&self) -> NodeId {
        match self {
            ClusterEvent::NodeUp { node, .. } | ClusterEvent::NodeDown { node } => *node,
        }
    }
}

/// Source of ordered cluster events for one local node.
///
/// Implementations must deliver events for a given remote node in the order
/// they happened: never a second node-up without an intervening node-down.
#[async_trait]
pub trait FailureAdapter: Send + 'static {
    /// Next event, or `None` once the adapter is shut down
    async fn next_event(&mut self) -> Option<ClusterEvent>;
}

#[async_trait]
impl FailureAdapter for mpsc::UnboundedReceiver<ClusterEvent> {
    async fn next_event(&mut self) -> Option<ClusterEvent> {
        self.recv().await
    }
}
