//! Hashed timing wheel with O(1) schedule/cancel and bounded per-tick work.
//!
//! Single-level, power-of-two slots. Deadlines further out than one rotation
//! stay parked in their slot until the cursor reaches them, so any delay is
//! accepted. Tick streams fired timers via callback to avoid per-tick
//! allocation.

use crate::timing::slab::{Slab, SlabIndex};

/// Handle returned to callers; includes index and generation to detect stale use.
pub struct TimerHandle<T> {
    idx: SlabIndex<T>,
    generation: u32,
}

impl<T> core::fmt::Debug for TimerHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("idx", &self.idx)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> PartialEq for TimerHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx && self.generation == other.generation
    }
}

impl<T> Eq for TimerHandle<T> {}

impl<T> Copy for TimerHandle<T> {}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

/// Witness type for power-of-two values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerOfTwo(usize);

impl PowerOfTwo {
    #[must_use]
    pub const fn new(val: usize) -> Option<Self> {
        if val.is_power_of_two() {
            Some(Self(val))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Hashed timing wheel.
pub struct Wheel<T> {
    slots: Vec<Option<SlabIndex<T>>>, // head of list per slot
    slab: Slab<T>,
    mask: usize,
    cursor: u64, // last tick processed
    pub max_fired_per_tick: usize,
    pub max_slot_depth: usize,
}

impl<T> Wheel<T> {
    /// Create a new wheel with `slots` buckets and room for `capacity` timers
    /// before the slab has to grow.
    #[must_use]
    pub fn new(slots: PowerOfTwo, capacity: usize) -> Self {
        let slots_val = slots.get();
        Self {
            slots: vec![None; slots_val],
            slab: Slab::with_capacity(capacity),
            mask: slots_val - 1,
            cursor: 0,
            max_fired_per_tick: 0,
            max_slot_depth: 0,
        }
    }

    /// Last tick the wheel has been advanced to.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of armed timers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.slab.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.slab.len() == 0
    }

    /// Schedule `payload` to fire once the wheel reaches tick `deadline`.
    ///
    /// Deadlines at or before the cursor fire on the next tick.
    pub fn schedule_at(&mut self, deadline: u64, payload: T) -> TimerHandle<T> {
        let deadline = deadline.max(self.cursor + 1);
        let slot = (deadline as usize) & self.mask;
        let head = self.slots[slot];
        let (idx, generation) = {
            let (idx, node) = self.slab.alloc(payload, deadline);
            node.next = head;
            node.prev = None;
            (idx, node.generation)
        };
        // Insert at head of slot list
        if let Some(head_idx) = head {
            if let Some(head) = self.slab.get_mut(head_idx) {
                head.prev = Some(idx);
            }
        }
        self.slots[slot] = Some(idx);
        TimerHandle { idx, generation }
    }

    /// Cancel a timer by handle, returning its payload.
    ///
    /// Returns `None` for stale handles (already fired or cancelled).
    pub fn cancel(&mut self, handle: TimerHandle<T>) -> Option<T> {
        let node = self.slab.get(handle.idx)?;
        if node.generation != handle.generation {
            return None;
        }

        let idx = handle.idx;
        let next = node.next;
        let prev = node.prev;
        let deadline = node.deadline;
        if let Some(p) = prev {
            if let Some(pnode) = self.slab.get_mut(p) {
                pnode.next = next;
            }
        } else {
            // head of slot list
            let slot = (deadline as usize) & self.mask;
            self.slots[slot] = next;
        }
        if let Some(n) = next {
            if let Some(nnode) = self.slab.get_mut(n) {
                nnode.prev = prev;
            }
        }

        self.slab.free(idx).flatten()
    }

    /// Advance the wheel to `now_tick` and invoke `on_fire` for each due timer.
    ///
    /// `on_fire` receives the handle (for callers that stash it) and the payload by value.
    pub fn tick(&mut self, now_tick: u64, mut on_fire: impl FnMut(TimerHandle<T>, T)) {
        if now_tick <= self.cursor {
            return;
        }
        // Walking more than one full rotation revisits the same slots.
        let first = self.cursor + 1;
        let last = now_tick.min(self.cursor + self.slots.len() as u64);
        for tick in first..=last {
            let slot = (tick as usize) & self.mask;
            let mut head = self.slots[slot];
            let mut pending_head: Option<SlabIndex<T>> = None;
            let mut slot_depth = 0;
            let mut fired_count = 0;
            while let Some(idx) = head {
                slot_depth += 1;
                // Save next before we potentially move/free.
                let next = self.slab.get(idx).and_then(|n| n.next);
                let due = self
                    .slab
                    .get(idx)
                    .is_some_and(|n| n.deadline <= now_tick);

                if due {
                    if let Some(node) = self.slab.get_mut(idx) {
                        let generation = node.generation;
                        if let Some(payload) = node.payload.take() {
                            on_fire(TimerHandle { idx, generation }, payload);
                            fired_count += 1;
                        }
                    }
                    self.slab.free(idx);
                } else {
                    // Keep pending by pushing to pending_head
                    if let Some(node) = self.slab.get_mut(idx) {
                        node.next = pending_head;
                        node.prev = None;
                    }
                    if let Some(ph) = pending_head {
                        if let Some(pnode) = self.slab.get_mut(ph) {
                            pnode.prev = Some(idx);
                        }
                    }
                    pending_head = Some(idx);
                }
                head = next;
            }
            self.slots[slot] = pending_head;
            self.max_slot_depth = self.max_slot_depth.max(slot_depth);
            self.max_fired_per_tick = self.max_fired_per_tick.max(fired_count);
        }
        self.cursor = now_tick;
    }

    /// Removes every armed timer, handing each payload to `on_drain`.
    pub fn drain(&mut self, mut on_drain: impl FnMut(T)) {
        for slot in 0..self.slots.len() {
            let mut head = self.slots[slot].take();
            while let Some(idx) = head {
                head = self.slab.get(idx).and_then(|n| n.next);
                if let Some(Some(payload)) = self.slab.free(idx) {
                    on_drain(payload);
                }
            }
        }
    }
}
