//! Session epoch clock
//!
//! Every peer session a node opens is stamped with a fresh epoch from this
//! clock. Draws are strictly increasing and never fall below the wall clock in
//! microseconds, so a node that restarts under the same id keeps drawing
//! epochs above anything its previous incarnation handed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Epoch;

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Node-wide source of session epochs, shared by every scope on the node
#[derive(Debug, Clone)]
pub struct EpochClock {
    last: Arc<AtomicU64>,
}

impl EpochClock {
    /// A clock for a new node incarnation
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A clock whose first draw is above `last`
    pub fn starting_at(last: Epoch) -> Self {
        Self { last: Arc::new(AtomicU64::new(last)) }
    }

    /// Draw the next epoch
    pub fn next(&self) -> Epoch {
        let now = wall_micros();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    /// Most recent epoch drawn, or the starting point
    pub fn last(&self) -> Epoch {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}
