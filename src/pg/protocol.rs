//! Wire sub-protocol between scope registries on different nodes
//!
//! Every message carries a [`Header`] naming the scope, the sending node and the
//! sender's epoch for the session it travels on. Frames are bincode-encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::PgResult;
use crate::pg::table::GroupSnapshot;
use crate::types::{Epoch, GroupName, Member, NodeId, ScopeName};

/// Routing and ordering information carried by every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub scope: ScopeName,
    pub node: NodeId,
    pub epoch: Epoch,
}

impl Header {
    pub fn new(scope: impl Into<ScopeName>, node: NodeId, epoch: Epoch) -> Self {
        Self { scope: scope.into(), node, epoch }
    }
}

/// Messages exchanged between peer sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PgMessage {
    /// One occurrence of `member` joined `group` on the sender
    JoinDelta { header: Header, group: GroupName, member: Member },
    /// One occurrence of `member` left `group` on the sender
    LeaveDelta { header: Header, group: GroupName, member: Member },
    /// Ask the receiver to send its full local state
    FullSyncRequest { header: Header },
    /// The sender's full local state; replaces everything mirrored for it
    FullSyncReply { header: Header, groups: GroupSnapshot },
}

impl PgMessage {
    pub fn header(&self) -> &Header {
        match self {
            PgMessage::JoinDelta { header, .. }
            | PgMessage::LeaveDelta { header, .. }
            | PgMessage::FullSyncRequest { header }
            | PgMessage::FullSyncReply { header, .. } => header,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PgMessage::JoinDelta { .. } => "JOIN_DELTA",
            PgMessage::LeaveDelta { .. } => "LEAVE_DELTA",
            PgMessage::FullSyncRequest { .. } => "FULL_SYNC_REQUEST",
            PgMessage::FullSyncReply { .. } => "FULL_SYNC_REPLY",
        }
    }

    pub fn encode(&self) -> PgResult<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(frame: &[u8]) -> PgResult<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}
