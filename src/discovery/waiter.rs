//! Quorum-style service discovery
//!
//! [`ServiceWaiter`] blocks until a group holds at least a minimum number of
//! occurrences, or a deadline passes. It only uses the public read side of a
//! scope registry: the change subscription, backed by bounded polling.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::WaiterConfig;
use crate::error::{PgError, PgResult};
use crate::pg::{PgDirectory, ScopeRegistry};
use crate::types::Member;

/// Deadline used when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Waits for groups to reach a minimum size
#[derive(Debug, Clone)]
pub struct ServiceWaiter {
    directory: PgDirectory,
    config: WaiterConfig,
}

impl ServiceWaiter {
    /// Waiter using the directory's configured settings
    pub fn new(directory: PgDirectory) -> Self {
        let config = directory.config().waiter.clone();
        Self { directory, config }
    }

    pub fn with_config(directory: PgDirectory, config: WaiterConfig) -> Self {
        Self { directory, config }
    }

    /// Wait until `group` in `scope` has at least `min_count` occurrences.
    ///
    /// Duplicate occurrences of the same member count toward `min_count`.
    /// Returns the satisfying snapshot, or [`PgError::Timeout`].
    pub async fn wait(
        &self,
        scope: &str,
        group: &str,
        min_count: usize,
        timeout: Duration,
    ) -> PgResult<Vec<Member>> {
        let registry = self.directory.scope(scope)?;
        wait_for_members(&registry, group, min_count, timeout, self.config.poll_interval()).await
    }

    /// Same as [`ServiceWaiter::wait`] with the timeout in milliseconds
    pub async fn start(
        &self,
        scope: &str,
        group: &str,
        min_count: usize,
        timeout_ms: u64,
    ) -> PgResult<Vec<Member>> {
        self.wait(scope, group, min_count, Duration::from_millis(timeout_ms)).await
    }

    /// Wait with the configured default timeout
    pub async fn wait_default(&self, scope: &str, group: &str, min_count: usize) -> PgResult<Vec<Member>> {
        self.wait(scope, group, min_count, self.config.default_timeout()).await
    }
}

/// Wait on a single registry.
///
/// Nothing is registered with the registry: the watch receiver and the timer
/// are owned by this future, so dropping it (cancellation) releases both.
pub async fn wait_for_members(
    registry: &ScopeRegistry,
    group: &str,
    min_count: usize,
    timeout: Duration,
    poll_interval: Duration,
) -> PgResult<Vec<Member>> {
    let now = Instant::now();
    let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
    let mut changes = registry.watch();
    let mut poll = time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut subscribed = true;

    loop {
        let members = changes.borrow_and_update().members(group);
        if members.len() >= min_count {
            debug!(scope = %registry.name(), group = %group, count = members.len(), "group reached minimum size");
            return Ok(members);
        }

        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let seen = registry.get_members(group).len();
                if seen >= min_count {
                    return Ok(registry.get_members(group));
                }
                return Err(PgError::Timeout { group: group.to_string(), wanted: min_count, seen });
            }
            changed = changes.changed(), if subscribed => {
                if changed.is_err() {
                    debug!(scope = %registry.name(), "registry stopped, falling back to polling");
                    subscribed = false;
                }
            }
            _ = poll.tick() => {}
        }
    }
}
