//! Local process table
//!
//! Tracks which processes are alive on this node and owns the monitors attached
//! to them. Exiting a process removes it and fires its monitors outside any lock.
//! The table is the node's runtime handle, so it also carries the node's
//! session [`EpochClock`].

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::runtime::clock::EpochClock;
use crate::runtime::monitor::{ExitCallback, Monitor, MonitorRef};
use crate::types::{ExitReason, Member, NodeId, Pid};

#[derive(Debug, Default)]
struct ProcessEntry {
    name: Option<String>,
    monitors: HashMap<MonitorRef, Monitor>,
}

#[derive(Debug)]
struct ProcessTableInner {
    processes: DashMap<Pid, ProcessEntry>,
    /// Reverse index so a monitor can be released by reference alone
    monitor_index: DashMap<MonitorRef, Pid>,
}

/// Registry of live processes on one node
#[derive(Debug, Clone)]
pub struct ProcessTable {
    node: NodeId,
    clock: EpochClock,
    inner: Arc<ProcessTableInner>,
}

impl ProcessTable {
    /// Create an empty table for a new incarnation of `node`
    pub fn new(node: NodeId) -> Self {
        Self::with_clock(node, EpochClock::new())
    }

    /// Create an empty table drawing session epochs from `clock`
    pub fn with_clock(node: NodeId, clock: EpochClock) -> Self {
        Self {
            node,
            clock,
            inner: Arc::new(ProcessTableInner {
                processes: DashMap::new(),
                monitor_index: DashMap::new(),
            }),
        }
    }

    /// Node this table belongs to
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Session epoch clock of this node
    pub fn epoch_clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Spawn a new live process and return its member handle
    pub fn spawn(&self) -> Member {
        self.spawn_entry(None)
    }

    /// Spawn a process with a descriptive name
    pub fn spawn_named(&self, name: impl Into<String>) -> Member {
        self.spawn_entry(Some(name.into()))
    }

    fn spawn_entry(&self, name: Option<String>) -> Member {
        let pid = Pid::new();
        self.inner.processes.insert(pid, ProcessEntry { name, monitors: HashMap::new() });
        Member::new(self.node, pid)
    }

    /// Check if a process is alive
    pub fn is_alive(&self, pid: Pid) -> bool {
        self.inner.processes.contains_key(&pid)
    }

    /// Name given at spawn time, if any
    pub fn name_of(&self, pid: Pid) -> Option<String> {
        self.inner.processes.get(&pid).and_then(|entry| entry.name.clone())
    }

    /// Number of live processes
    pub fn len(&self) -> usize {
        self.inner.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.processes.is_empty()
    }

    /// Attach a monitor to a live process.
    ///
    /// Returns `None` if the process is not alive. The liveness check, the
    /// install and the index entry all happen under the process's shard lock,
    /// so an exit either sees the monitor fully installed or not at all.
    pub fn monitor(&self, pid: Pid, callback: ExitCallback) -> Option<MonitorRef> {
        let mut entry = self.inner.processes.get_mut(&pid)?;
        let monitor = Monitor::new(callback);
        let monitor_ref = monitor.monitor_ref;
        entry.monitors.insert(monitor_ref, monitor);
        self.inner.monitor_index.insert(monitor_ref, pid);
        Some(monitor_ref)
    }

    /// Number of monitors that can still be released by reference
    pub fn indexed_monitors(&self) -> usize {
        self.inner.monitor_index.len()
    }

    /// Release a monitor without firing it. Returns false if it was not installed.
    pub fn demonitor(&self, monitor_ref: MonitorRef) -> bool {
        let Some((_, pid)) = self.inner.monitor_index.remove(&monitor_ref) else {
            return false;
        };
        match self.inner.processes.get_mut(&pid) {
            Some(mut entry) => entry.monitors.remove(&monitor_ref).is_some(),
            None => false,
        }
    }

    /// Number of monitors currently attached to `pid`
    pub fn monitor_count(&self, pid: Pid) -> usize {
        self.inner
            .processes
            .get(&pid)
            .map(|entry| entry.monitors.len())
            .unwrap_or(0)
    }

    /// Terminate a process, firing every monitor attached to it.
    /// Returns false if the process was not alive.
    pub fn exit(&self, pid: Pid, reason: ExitReason) -> bool {
        let Some((_, entry)) = self.inner.processes.remove(&pid) else {
            return false;
        };

        debug!(pid = %pid, reason = %reason, monitors = entry.monitors.len(), "process exited");
        for (monitor_ref, monitor) in entry.monitors {
            self.inner.monitor_index.remove(&monitor_ref);
            monitor.fire(pid, reason.clone());
        }
        true
    }

    /// Kill a process
    pub fn kill(&self, pid: Pid) -> bool {
        self.exit(pid, ExitReason::Killed)
    }
}
