//! Scoped process groups
//!
//! Processes on any node join and leave named groups inside a named scope;
//! every node sees an eventually consistent, cluster-wide view of each group.
//!
//! - [`table`]: the per-group multiset, pure data.
//! - [`protocol`]: the four wire messages exchanged between peers.
//! - [`session`]: one session per connected node, with epoch bookkeeping.
//! - [`scope`]: the per-scope registry actor.
//! - [`directory`]: the registry of scopes fed by the failure adapter.
//!
//! Local state is authoritative. Remote state is a mirror, rebuilt in full by
//! a two-way snapshot exchange each time a node connects, kept current by
//! deltas while the session lives, and purged when the node goes down.

pub mod directory;
pub mod protocol;
pub mod scope;
pub mod session;
pub mod table;

pub use directory::PgDirectory;
pub use protocol::{Header, PgMessage};
pub use scope::{MembershipEvent, ScopeRegistry};
pub use session::{EpochBook, PeerInfo, PeerSession, SessionState};
pub use table::{GroupSnapshot, MembershipTable, MembershipView, TableDiff};
