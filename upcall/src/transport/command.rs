//! The pending command: one outstanding unit of work awaiting a reply.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use minstant::Instant;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::region::Region;
use crate::timing::TimerHandle;
use crate::transport::sequence::CommandId;
use crate::transport::supervisor::TimerEntry;

/// Lifecycle status of a pending command.
///
/// ```text
/// Sending ──pull──> Handling ──ack──> Acked
///    │                  │               │
///    └──────────────────┴───reply───────┴──> Done
///    (any non-terminal) ──expiry/detach──> TimedOut
///    (any non-terminal) ──shutdown──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Queued, waiting for the consumer to pull it.
    Sending = 0,
    /// Pulled by the consumer.
    Handling = 1,
    /// Consumer confirmed it is working on it.
    Acked = 2,
    /// Reply delivered.
    Done = 3,
    /// A staged deadline passed, or the consumer went away.
    TimedOut = 4,
    /// The transport shut down underneath it.
    Cancelled = 5,
}

impl Status {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::TimedOut | Self::Cancelled)
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Sending,
            1 => Self::Handling,
            2 => Self::Acked,
            3 => Self::Done,
            4 => Self::TimedOut,
            _ => Self::Cancelled,
        }
    }
}

pub(crate) type TimerSlot = TimerHandle<TimerEntry>;

/// Mutable per-command state, guarded by the command's own mutex.
pub(crate) struct CommandState {
    status: Status,
    resolved: bool,
    /// Reply bytes that did not land in scatter regions.
    pub inbound: Vec<u8>,
    /// Reply bytes written into `scatter_in`.
    pub scattered: usize,
    /// Next `scatter_out` region to hand to the consumer.
    pub cursor: usize,
    /// The live timer entry, if armed.
    pub timer: Option<TimerSlot>,
    /// When the current stage's budget runs out.
    pub deadline: Instant,
    /// The caller gave up waiting. Does not affect `status`.
    pub interrupted: bool,
}

impl CommandState {
    pub const fn status(&self) -> Status {
        self.status
    }
}

/// A submitted command and everything needed to deliver and resolve it.
///
/// Shared between the submitting caller, the timer and the consumer through
/// [`CommandRef`](crate::transport::pending::CommandRef) holders.
pub struct PendingCommand {
    id: CommandId,
    outbound: Vec<u8>,
    scatter_out: Vec<Region>,
    scatter_in: Vec<Region>,
    /// Outstanding holders; see `PendingSet::release`.
    pub(crate) holders: AtomicUsize,
    /// Mirror of `state.status` for lock-free reads. Written under the state lock.
    status: AtomicU8,
    state: Mutex<CommandState>,
    waiter: Condvar,
}

impl PendingCommand {
    pub(crate) fn new(
        id: CommandId,
        outbound: Vec<u8>,
        scatter_out: Vec<Region>,
        scatter_in: Vec<Region>,
    ) -> Self {
        Self {
            id,
            outbound,
            scatter_out,
            scatter_in,
            holders: AtomicUsize::new(0),
            status: AtomicU8::new(Status::Sending as u8),
            state: Mutex::new(CommandState {
                status: Status::Sending,
                resolved: false,
                inbound: Vec::new(),
                scattered: 0,
                cursor: 0,
                timer: None,
                deadline: Instant::now(),
                interrupted: false,
            }),
            waiter: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CommandId {
        self.id
    }

    /// Current status, without taking the state lock.
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    #[must_use]
    pub fn scatter_out(&self) -> &[Region] {
        &self.scatter_out
    }

    #[must_use]
    pub fn scatter_in(&self) -> &[Region] {
        &self.scatter_in
    }

    /// Outstanding holder count.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock()
    }

    /// Moves between non-terminal statuses.
    pub(crate) fn advance(&self, st: &mut CommandState, to: Status) {
        debug_assert!(!to.is_terminal(), "advance to terminal {to:?}");
        debug_assert!(!st.status.is_terminal(), "advance out of {:?}", st.status);
        st.status = to;
        self.status.store(to as u8, Ordering::Release);
    }

    /// Moves to a terminal status and wakes the waiter.
    ///
    /// Returns the outstanding timer entry so the caller can cancel it once
    /// the state lock is released.
    ///
    /// # Panics
    ///
    /// Panics if the command was already resolved; resolving twice is a
    /// logic error in the transport.
    pub(crate) fn finish(&self, st: &mut CommandState, to: Status) -> Option<TimerSlot> {
        assert!(to.is_terminal(), "finish with non-terminal {to:?}");
        assert!(!st.resolved, "command {} resolved twice", self.id);
        st.resolved = true;
        st.status = to;
        self.status.store(to as u8, Ordering::Release);
        self.waiter.notify_all();
        st.timer.take()
    }

    /// Blocks on the waiter, releasing `st` while asleep.
    pub(crate) fn wait(&self, st: &mut MutexGuard<'_, CommandState>) {
        self.waiter.wait(st);
    }

    /// Wakes the waiter without resolving (used for interruption).
    pub(crate) fn wake(&self) {
        self.waiter.notify_all();
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("holders", &self.holders())
            .field("outbound_len", &self.outbound.len())
            .field("scatter_out", &self.scatter_out.len())
            .field("scatter_in", &self.scatter_in.len())
            .finish()
    }
}
