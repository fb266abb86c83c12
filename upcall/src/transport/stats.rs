//! Running counters for a transport and their point-in-time snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub interrupted: AtomicU64,
    pub rejected: AtomicU64,
    pub cancelled: AtomicU64,
    pub drained: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending: usize, high_water: (usize, usize)) -> TransportStats {
        TransportStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            pending,
            max_fired_per_tick: high_water.0,
            max_slot_depth: high_water.1,
        }
    }
}

/// Snapshot of a transport's counters.
///
/// Counters are read individually, so a snapshot taken under load may be
/// off by the commands resolving while it was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Commands accepted for delivery.
    pub submitted: u64,
    /// Commands answered by the consumer.
    pub completed: u64,
    /// Commands whose stage deadline passed.
    pub timed_out: u64,
    /// Waits abandoned through an interrupt.
    pub interrupted: u64,
    /// Submissions refused because no consumer was attached.
    pub rejected: u64,
    /// Commands cancelled by transport shutdown.
    pub cancelled: u64,
    /// Commands forced to time out when the consumer detached.
    pub drained: u64,
    /// Commands currently held in the pending set.
    pub pending: usize,
    /// Most timers the supervisor fired in a single tick.
    pub max_fired_per_tick: usize,
    /// Deepest timing wheel slot the supervisor has walked.
    pub max_slot_depth: usize,
}
