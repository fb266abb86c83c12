//! Staged timeout supervision.
//!
//! Every non-terminal command has at most one live entry in a hashed timing
//! wheel. The entry owns a [`CommandRef`], so an armed timer keeps its
//! command alive. A dedicated thread advances the wheel every tick and
//! times out commands whose stage deadline has passed.
//!
//! # Locking
//!
//! The wheel lock nests inside a command lock, never the other way round.
//! Entries leaving the wheel (fired, cancelled or drained) are dropped only
//! after both locks are released, since dropping a hold can take the set
//! lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};

use crate::timing::{PowerOfTwo, Wheel};
use crate::trace::{debug, trace};
use crate::transport::command::{Status, TimerSlot};
use crate::transport::config::MAX_STAGE;
use crate::transport::pending::CommandRef;
use crate::transport::stats::Counters;

/// Initial wheel capacity before the slab grows.
const INITIAL_TIMERS: usize = 256;

/// Wheel payload: the timer's hold on its command.
pub(crate) struct TimerEntry {
    cmd: CommandRef,
}

pub(crate) struct Supervisor {
    wheel: Mutex<Wheel<TimerEntry>>,
    origin: Instant,
    tick: Duration,
    shutdown: AtomicBool,
    parked: Mutex<()>,
    wakeup: Condvar,
}

impl Supervisor {
    pub fn new(slots: PowerOfTwo, tick: Duration) -> Self {
        Self {
            wheel: Mutex::new(Wheel::new(slots, INITIAL_TIMERS)),
            origin: Instant::now(),
            tick,
            shutdown: AtomicBool::new(false),
            parked: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// First tick at or after `deadline`.
    fn deadline_tick(&self, deadline: Instant) -> u64 {
        let nanos = deadline.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(nanos.div_ceil(self.tick.as_nanos())).unwrap_or(u64::MAX)
    }

    /// Last tick fully elapsed at `now`.
    fn tick_at(&self, now: Instant) -> u64 {
        let nanos = now.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(nanos / self.tick.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Starts the stage for `stage` with `budget`, replacing any live entry.
    ///
    /// A command that has already moved past `stage` is left alone. Budgets
    /// are capped at [`MAX_STAGE`].
    pub fn arm(&self, cmd: &CommandRef, stage: Status, budget: Duration) {
        let stale = {
            let mut st = cmd.lock();
            if st.status() != stage {
                return;
            }
            let deadline = Instant::now() + budget.min(MAX_STAGE);
            let mut wheel = self.wheel.lock();
            let handle = wheel.schedule_at(
                self.deadline_tick(deadline),
                TimerEntry { cmd: cmd.share() },
            );
            st.deadline = deadline;
            st.timer.replace(handle).and_then(|old| wheel.cancel(old))
        };
        trace!(
            id = %cmd.id(),
            stage = ?stage,
            budget_ms = budget.as_millis() as u64,
            "timer armed"
        );
        drop(stale);
    }

    /// Cancels an entry handed back by a resolution.
    pub fn cancel(&self, handle: TimerSlot) {
        let entry = self.wheel.lock().cancel(handle);
        drop(entry);
    }

    /// Number of armed entries.
    #[cfg(test)]
    pub fn armed(&self) -> usize {
        self.wheel.lock().len()
    }

    /// Fires every entry due at `now` and returns how many commands timed out.
    ///
    /// `fired` is scratch space reused across calls.
    pub fn fire_due(&self, now: Instant, fired: &mut Vec<(TimerSlot, TimerEntry)>) -> u64 {
        let now_tick = self.tick_at(now);
        self.wheel
            .lock()
            .tick(now_tick, |handle, entry| fired.push((handle, entry)));

        let mut timed_out = 0;
        for (handle, entry) in fired.drain(..) {
            if self.expire(handle, &entry, now) {
                timed_out += 1;
            }
            drop(entry);
        }
        timed_out
    }

    fn expire(&self, handle: TimerSlot, entry: &TimerEntry, now: Instant) -> bool {
        let cmd = &entry.cmd;
        let mut st = cmd.lock();
        if st.timer != Some(handle) || st.status().is_terminal() {
            // Superseded by a rearm or already resolved.
            return false;
        }
        st.timer = None;
        if now < st.deadline {
            // Tick rounding fired it early; wait out the remainder.
            let handle = self
                .wheel
                .lock()
                .schedule_at(self.deadline_tick(st.deadline), TimerEntry { cmd: cmd.share() });
            st.timer = Some(handle);
            return false;
        }
        debug!(id = %cmd.id(), from = ?st.status(), "command timed out");
        let leftover = cmd.finish(&mut st, Status::TimedOut);
        debug_assert!(leftover.is_none());
        true
    }

    /// Timer thread body. Returns once [`Supervisor::stop`] is called.
    pub fn run(&self, counters: &Counters) {
        let mut fired = Vec::new();
        loop {
            {
                let mut parked = self.parked.lock();
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.wakeup.wait_for(&mut parked, self.tick);
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let timed_out = self.fire_due(Instant::now(), &mut fired);
            if timed_out > 0 {
                Counters::add(&counters.timed_out, timed_out);
            }
        }
    }

    /// Asks the timer thread to exit.
    pub fn stop(&self) {
        let _parked = self.parked.lock();
        self.shutdown.store(true, Ordering::Release);
        self.wakeup.notify_all();
    }

    /// Empties the wheel, releasing every timer's hold.
    pub fn drain(&self) {
        let mut entries = Vec::new();
        self.wheel.lock().drain(|entry| entries.push(entry));
        drop(entries);
    }

    /// Wheel high-water marks: most timers fired in one tick and deepest slot seen.
    pub fn high_water(&self) -> (usize, usize) {
        let wheel = self.wheel.lock();
        (wheel.max_fired_per_tick, wheel.max_slot_depth)
    }
}
