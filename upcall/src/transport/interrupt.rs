//! Caller-side interruption of a blocked submit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::transport::command::PendingCommand;

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    waiters: Mutex<Vec<Weak<PendingCommand>>>,
}

/// A token that makes a submit cancellable.
///
/// Attach it with [`Request::interruptible`](crate::Request::interruptible).
/// Firing it wakes every caller blocked on a command submitted with the
/// token; they return [`SubmitError::Interrupted`](crate::SubmitError::Interrupted).
/// The commands themselves stay in flight until answered or timed out, so
/// the consumer never sees a command vanish under it.
///
/// Clones share the same token.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

impl Interrupt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupts every current and future wait that uses this token.
    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for waiter in waiters {
            if let Some(cmd) = waiter.upgrade() {
                cmd.lock().interrupted = true;
                cmd.wake();
            }
        }
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, cmd: &Arc<PendingCommand>) {
        {
            let mut waiters = self.inner.waiters.lock();
            waiters.retain(|w| w.strong_count() > 0);
            waiters.push(Arc::downgrade(cmd));
        }
        if self.is_fired() {
            cmd.lock().interrupted = true;
        }
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("fired", &self.is_fired())
            .finish_non_exhaustive()
    }
}
