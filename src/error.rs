//! Error types for REAM process groups

use thiserror::Error;
use crate::types::{GroupName, Member, NodeId};

/// Main error type for process-group operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PgError {
    /// Join called with a handle that is not local or not alive
    #[error("Invalid member {0}: not a live local process")]
    InvalidMember(Member),

    /// Leave called with no matching occurrence
    #[error("{member} is not a member of group '{group}'")]
    NotMember { group: GroupName, member: Member },

    /// A wait deadline elapsed before the group was large enough
    #[error("Timed out waiting for group '{group}': wanted {wanted} members, saw {seen}")]
    Timeout { group: GroupName, wanted: usize, seen: usize },

    /// No scope registered under that name
    #[error("Scope '{0}' not found")]
    ScopeNotFound(String),

    /// A scope with that name is already running
    #[error("Scope '{0}' already exists")]
    ScopeExists(String),

    /// The scope actor has shut down
    #[error("Scope '{0}' has stopped")]
    RegistryStopped(String),

    /// No live peer session for the node
    #[error("Node {0} is not connected")]
    NodeNotConnected(NodeId),

    /// The outbound channel to a peer is gone
    #[error("Channel to node {0} is closed")]
    ChannelClosed(NodeId),

    /// Wire encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for process-group operations
pub type PgResult<T> = Result<T, PgError>;

impl From<bincode::Error> for PgError {
    fn from(err: bincode::Error) -> Self {
        PgError::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for PgError {
    fn from(err: toml::de::Error) -> Self {
        PgError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PgError {
    fn from(err: toml::ser::Error) -> Self {
        PgError::Config(err.to_string())
    }
}

impl From<std::io::Error> for PgError {
    fn from(err: std::io::Error) -> Self {
        PgError::Config(err.to_string())
    }
}
