//! The set of outstanding commands and the holder guard that keeps each one alive.
//!
//! Lookups hand out [`CommandRef`] guards. Every guard counts as one holder;
//! dropping it releases the hold. When the last holder of a command in a
//! terminal status lets go, the command leaves the set.
//!
//! Only structural operations take the set lock, and nothing blocks or
//! signals while holding it. When both locks are needed the order is always
//! set, then command.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::transport::command::{PendingCommand, Status};
use crate::transport::sequence::CommandId;

/// A counted hold on a pending command.
///
/// Held by the submitting caller, by an armed timer entry, and by the
/// consumer while it copies data out or resolves a reply.
pub(crate) struct CommandRef {
    cmd: Arc<PendingCommand>,
    set: Arc<PendingSet>,
}

impl CommandRef {
    fn acquire(cmd: Arc<PendingCommand>, set: Arc<PendingSet>) -> Self {
        cmd.holders.fetch_add(1, Ordering::AcqRel);
        Self { cmd, set }
    }

    /// Takes an additional hold on the same command.
    pub(crate) fn share(&self) -> Self {
        Self::acquire(Arc::clone(&self.cmd), Arc::clone(&self.set))
    }

    pub(crate) fn command(&self) -> &Arc<PendingCommand> {
        &self.cmd
    }
}

impl Deref for CommandRef {
    type Target = PendingCommand;

    fn deref(&self) -> &PendingCommand {
        &self.cmd
    }
}

impl Drop for CommandRef {
    fn drop(&mut self) {
        self.set.release(&self.cmd);
    }
}

struct Inner {
    by_id: HashMap<CommandId, Arc<PendingCommand>>,
    /// Admission order; entries that stopped being `Sending` are skipped lazily.
    admission: VecDeque<CommandId>,
}

/// Outstanding commands, keyed by id and ordered by admission.
pub struct PendingSet {
    inner: Mutex<Inner>,
}

impl PendingSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                admission: VecDeque::new(),
            }),
        }
    }

    /// Adds `cmd` and returns the submitting caller's hold on it.
    ///
    /// # Panics
    ///
    /// Panics if a command with the same id is already present.
    pub(crate) fn insert(self: &Arc<Self>, cmd: PendingCommand) -> CommandRef {
        let cmd = Arc::new(cmd);
        let id = cmd.id();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        assert!(
            !inner.by_id.contains_key(&id),
            "duplicate command id {id} inserted"
        );
        inner.by_id.insert(id, Arc::clone(&cmd));
        inner.admission.push_back(id);
        CommandRef::acquire(cmd, Arc::clone(self))
    }

    /// Looks up a command by id, taking a hold on it.
    pub(crate) fn lookup(self: &Arc<Self>, id: CommandId) -> Option<CommandRef> {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(&id)
            .map(|cmd| CommandRef::acquire(Arc::clone(cmd), Arc::clone(self)))
    }

    /// Peeks the oldest command still in `Sending`, taking a hold on it.
    ///
    /// The command stays queued; [`PendingSet::mark_handling`] dequeues it
    /// once the consumer has actually copied it out.
    pub(crate) fn next_admissible(self: &Arc<Self>) -> Option<CommandRef> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        while let Some(id) = inner.admission.front().copied() {
            match inner.by_id.get(&id) {
                Some(cmd) if cmd.status() == Status::Sending => {
                    return Some(CommandRef::acquire(Arc::clone(cmd), Arc::clone(self)));
                }
                _ => {
                    inner.admission.pop_front();
                }
            }
        }
        None
    }

    /// Whether any queued command is still `Sending`.
    #[must_use]
    pub fn has_admissible(&self) -> bool {
        let inner = self.inner.lock();
        inner.admission.iter().any(|id| {
            inner
                .by_id
                .get(id)
                .is_some_and(|cmd| cmd.status() == Status::Sending)
        })
    }

    /// Flips a peeked command from `Sending` to `Handling` and dequeues it.
    ///
    /// Returns `false` if it went terminal since the peek; the consumer must
    /// then discard what it copied.
    pub(crate) fn mark_handling(&self, cmd: &CommandRef) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut st = cmd.lock();
        if st.status() != Status::Sending {
            return false;
        }
        cmd.advance(&mut st, Status::Handling);
        if let Some(pos) = inner.admission.iter().position(|id| *id == cmd.id()) {
            inner.admission.remove(pos);
        }
        true
    }

    /// Holds on every command currently in the set.
    pub(crate) fn snapshot(self: &Arc<Self>) -> Vec<CommandRef> {
        let inner = self.inner.lock();
        inner
            .by_id
            .values()
            .map(|cmd| CommandRef::acquire(Arc::clone(cmd), Arc::clone(self)))
            .collect()
    }

    /// Number of commands in the set, including terminal ones not yet released.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops one hold; the last hold on a terminal command removes it.
    ///
    /// # Panics
    ///
    /// Panics on underflow, which means a hold was released twice.
    fn release(&self, cmd: &Arc<PendingCommand>) {
        let prev = cmd.holders.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "release underflow on command {}", cmd.id());
        if prev != 1 || !cmd.status().is_terminal() {
            return;
        }
        let mut inner = self.inner.lock();
        // A lookup may have re-acquired it between the decrement and the lock.
        if cmd.holders.load(Ordering::Acquire) != 0 {
            return;
        }
        if inner
            .by_id
            .get(&cmd.id())
            .is_some_and(|entry| Arc::ptr_eq(entry, cmd))
        {
            inner.by_id.remove(&cmd.id());
        }
    }
}

impl Default for PendingSet {
    fn default() -> Self {
        Self::new()
    }
}
