//! Peer sessions and epoch bookkeeping
//!
//! A [`PeerSession`] exists for each connected remote node. It owns the
//! outbound half of the channel and the epoch this node stamps on everything it
//! sends there. [`EpochBook`] remembers, per remote node, which of its epochs is
//! current and the floor below which anything from it is stale.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cluster::PeerSender;
use crate::pg::protocol::PgMessage;
use crate::types::{Epoch, NodeId};

/// Connection state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Our full state has been sent; theirs has not arrived yet
    Connecting,
    /// Both full-state transfers have completed
    Synced,
    /// Retired after node-down
    Down,
}

/// Observable summary of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node: NodeId,
    pub state: SessionState,
    /// Epoch we stamp on messages to this peer
    pub local_epoch: Epoch,
    /// Epoch of the peer's last accepted full sync
    pub remote_epoch: Option<Epoch>,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// One live session with a remote node
#[derive(Debug)]
pub struct PeerSession {
    node: NodeId,
    state: SessionState,
    local_epoch: Epoch,
    remote_epoch: Option<Epoch>,
    outbound: PeerSender,
    frames_sent: u64,
    frames_received: u64,
}

impl PeerSession {
    /// Open a session in the connecting state
    pub fn open(node: NodeId, local_epoch: Epoch, outbound: PeerSender) -> Self {
        Self {
            node,
            state: SessionState::Connecting,
            local_epoch,
            remote_epoch: None,
            outbound,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_epoch(&self) -> Epoch {
        self.local_epoch
    }

    pub fn remote_epoch(&self) -> Option<Epoch> {
        self.remote_epoch
    }

    /// Encode and queue a message.
    ///
    /// A broken channel is logged and otherwise ignored: lost messages are
    /// never retried, the failure detector's node-down and a later node-up
    /// restart the cycle with a full resync.
    pub fn send(&mut self, message: &PgMessage) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %self.node.short(), kind = message.kind(), error = %e, "failed to encode message");
                return false;
            }
        };
        match self.outbound.send(frame) {
            Ok(()) => {
                self.frames_sent += 1;
                true
            }
            Err(e) => {
                debug!(peer = %self.node.short(), kind = message.kind(), error = %e, "peer channel closed, awaiting node-down");
                false
            }
        }
    }

    /// Count an inbound message
    pub fn observe(&mut self) {
        self.frames_received += 1;
    }

    /// The peer's full state has been applied
    pub fn mark_synced(&mut self, remote_epoch: Epoch) {
        self.remote_epoch = Some(remote_epoch);
        self.state = SessionState::Synced;
    }

    /// Retire the session after node-down
    pub fn retire(mut self) -> PeerInfo {
        self.state = SessionState::Down;
        self.info()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            node: self.node,
            state: self.state,
            local_epoch: self.local_epoch,
            remote_epoch: self.remote_epoch,
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
        }
    }
}

/// Per-remote-node epoch acceptance rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochBook {
    /// Epoch of the accepted full sync for the live session
    current: Option<Epoch>,
    /// Anything below this is from a dead session
    floor: Epoch,
}

impl EpochBook {
    pub fn current(&self) -> Option<Epoch> {
        self.current
    }

    pub fn floor(&self) -> Epoch {
        self.floor
    }

    /// A full sync (or sync request) is fresh if it is not older than the
    /// floor or the current epoch
    pub fn accepts_sync(&self, epoch: Epoch) -> bool {
        epoch >= self.floor && self.current.map_or(true, |current| epoch >= current)
    }

    /// Deltas must belong to exactly the current epoch
    pub fn accepts_delta(&self, epoch: Epoch) -> bool {
        self.current == Some(epoch)
    }

    /// A full sync at `epoch` has been applied
    pub fn advance(&mut self, epoch: Epoch) {
        self.current = Some(epoch);
        self.floor = self.floor.max(epoch);
    }

    /// The node went down: raise the floor past the last accepted epoch.
    ///
    /// Rejected epochs never move the floor, so a garbage epoch cannot lock a
    /// node out of its next session.
    pub fn retire(&mut self) {
        if let Some(current) = self.current.take() {
            self.floor = self.floor.max(current.saturating_add(1));
        }
    }
}
