//! Core types and data structures for REAM process groups

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of a scope (an isolated namespace of groups)
pub type ScopeName = String;

/// Name of a group within a scope
pub type GroupName = String;

/// Session counter stamped on every inter-node message
pub type Epoch = u64;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identifier - unique within the node that spawned it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl Pid {
    /// Generate a new unique PID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Pid(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw PID value
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Create a PID from a raw value
    pub fn from_raw(raw: u64) -> Self {
        Pid(raw)
    }
}

impl Default for Pid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered participant: the owning node plus its local identity.
///
/// Locality is decided by comparing `node` with the registry's own node id,
/// never by inspecting the pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Node owning the process
    pub node: NodeId,
    /// Process identity on that node
    pub pid: Pid,
}

impl Member {
    pub fn new(node: NodeId, pid: Pid) -> Self {
        Self { node, pid }
    }

    /// True when this member lives on `node`
    pub fn is_local_to(&self, node: NodeId) -> bool {
        self.node == node
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}@{}>", self.pid, self.node.short())
    }
}

/// Reason a local process terminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Orderly shutdown
    Normal,
    /// Killed from outside
    Killed,
    /// Crashed with an error
    Error(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Killed => write!(f, "killed"),
            ExitReason::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}
