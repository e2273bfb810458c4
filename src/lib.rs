//! # REAM process groups
//!
//! A scoped, replicated process-group registry. Processes on any node of a
//! cluster join and leave named groups inside a named scope, and every node
//! can query an eventually consistent view of each group's membership.
//!
//! Each node keeps its own registrations authoritative. Other nodes mirror
//! them through per-peer sessions: a full snapshot exchange on connect,
//! ordered deltas while connected, and a purge when the node goes down.
//! Epochs stamped on every message keep stragglers from a dead session out.

#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod config;
pub mod runtime;
pub mod pg;
pub mod cluster;
pub mod discovery;
/// Command-line interface and argument parsing
pub mod cli;
/// Command execution
pub mod commands;

// Re-export main types
pub use types::{Epoch, ExitReason, GroupName, Member, NodeId, Pid, ScopeName};
pub use error::{PgError, PgResult};
pub use config::{PgConfig, WaiterConfig};
pub use runtime::{EpochClock, MonitorRef, ProcessTable};
pub use pg::{MembershipEvent, MembershipTable, MembershipView, PgDirectory, PgMessage, ScopeRegistry};
pub use cluster::{ClusterEvent, FailureAdapter, LoopbackNetwork, PeerChannel, PeerSender};
pub use discovery::ServiceWaiter;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create the process table and scope directory for one node, attached to a
/// failure adapter
pub fn start_node<A: FailureAdapter>(node: NodeId, config: PgConfig, adapter: A) -> PgDirectory {
    PgDirectory::start(ProcessTable::new(node), config, adapter)
}
