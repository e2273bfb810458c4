//! Process monitors
//!
//! A monitor is a one-shot callback attached to a live local process. It fires
//! exactly once when the process exits, unless it is released first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{ExitReason, Pid};

/// Monitor reference for tracking monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorRef(pub u64);

impl MonitorRef {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        MonitorRef(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MonitorRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mon-{}", self.0)
    }
}

/// Callback invoked with the pid and exit reason of the monitored process
pub type ExitCallback = Box<dyn FnOnce(Pid, ExitReason) + Send + Sync + 'static>;

/// An installed monitor
pub(crate) struct Monitor {
    pub monitor_ref: MonitorRef,
    pub callback: ExitCallback,
}

impl Monitor {
    pub fn new(callback: ExitCallback) -> Self {
        Self {
            monitor_ref: MonitorRef::new(),
            callback,
        }
    }

    /// Consume the monitor, running its callback
    pub fn fire(self, pid: Pid, reason: ExitReason) {
        (self.callback)(pid, reason)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("monitor_ref", &self.monitor_ref)
            .field("callback", &"<callback>")
            .finish()
    }
}
