//! Generational slab allocator for intrusive timer nodes.

use core::marker::PhantomData;

/// Newtype for slab indices to prevent cross-slab misuse.
// Manual impls: derive would bound T, but PhantomData is just a marker.
pub struct SlabIndex<T>(u32, PhantomData<T>);

impl<T> core::fmt::Debug for SlabIndex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SlabIndex({})", self.0)
    }
}

impl<T> PartialEq for SlabIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for SlabIndex<T> {}

impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> From<u32> for SlabIndex<T> {
    #[inline]
    fn from(idx: u32) -> Self {
        Self(idx, PhantomData)
    }
}

impl<T> From<SlabIndex<T>> for usize {
    #[inline]
    fn from(idx: SlabIndex<T>) -> Self {
        idx.0 as Self
    }
}

/// Timer node stored in the slab.
pub struct Node<T> {
    /// Timer payload; always `Some` while occupied, taken when fired.
    pub payload: Option<T>,
    /// Generation counter for ABA protection.
    pub generation: u32,
    /// Next pointer in the per-slot timer list.
    pub next: Option<SlabIndex<T>>,
    /// Prev pointer in the per-slot timer list (None for head).
    pub prev: Option<SlabIndex<T>>,
    /// Absolute deadline in wheel ticks.
    pub deadline: u64,
}

/// Slot in the slab.
enum Entry<T> {
    Occupied(Node<T>),
    Free {
        next: Option<SlabIndex<T>>,
        generation: u32,
    },
}

/// Slab with intrusive free list.
///
/// Starts at the requested capacity and grows by one entry whenever the free
/// list is exhausted, so scheduling never fails for lack of room. Freed
/// entries are recycled before the slab grows again.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    occupied: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with `cap` pre-allocated free slots.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        let mut slab = Self {
            entries: Vec::with_capacity(cap),
            free_head: None,
            occupied: 0,
        };
        for _ in 0..cap {
            slab.grow();
        }
        slab
    }

    fn grow(&mut self) {
        let idx = u32::try_from(self.entries.len()).unwrap_or_else(|_| {
            panic!("timer slab exceeded {} entries", u32::MAX);
        });
        self.entries.push(Entry::Free {
            next: self.free_head,
            generation: 0,
        });
        self.free_head = Some(SlabIndex::from(idx));
    }

    /// Allocates a new node, returning its index and mutable ref.
    pub fn alloc(&mut self, payload: T, deadline: u64) -> (SlabIndex<T>, &mut Node<T>) {
        if self.free_head.is_none() {
            self.grow();
        }
        let Some(head) = self.free_head else {
            unreachable!("slab grew but free list is empty");
        };
        let (next_free, generation) = match &self.entries[usize::from(head)] {
            Entry::Free { next, generation } => (*next, *generation),
            Entry::Occupied(_) => unreachable!("free_head must point to free slot"),
        };
        self.free_head = next_free;
        self.occupied += 1;

        self.entries[usize::from(head)] = Entry::Occupied(Node {
            payload: Some(payload),
            generation,
            next: None,
            prev: None,
            deadline,
        });

        match &mut self.entries[usize::from(head)] {
            Entry::Occupied(node) => (head, node),
            Entry::Free { .. } => unreachable!("slot was just occupied"),
        }
    }

    /// Frees a node by index, handing back whatever payload it still holds.
    ///
    /// Returns `None` if the slot was already free.
    pub fn free(&mut self, idx: SlabIndex<T>) -> Option<Option<T>> {
        let slot = &mut self.entries[usize::from(idx)];
        let generation = match slot {
            Entry::Occupied(n) => n.generation,
            Entry::Free { .. } => return None,
        };
        let previous = core::mem::replace(
            slot,
            Entry::Free {
                next: self.free_head,
                generation: generation.wrapping_add(1),
            },
        );
        self.free_head = Some(idx);
        self.occupied -= 1;
        match previous {
            Entry::Occupied(node) => Some(node.payload),
            Entry::Free { .. } => None,
        }
    }

    /// Gets immutable ref to node by index if occupied.
    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>) -> Option<&Node<T>> {
        match self.entries.get(usize::from(idx)) {
            Some(Entry::Occupied(n)) => Some(n),
            _ => None,
        }
    }

    /// Gets mutable ref to node by index if occupied.
    pub fn get_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut Node<T>> {
        match self.entries.get_mut(usize::from(idx)) {
            Some(Entry::Occupied(n)) => Some(n),
            _ => None,
        }
    }

    /// Number of occupied nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.occupied
    }

    /// Number of slots ever allocated (occupied + free).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_past_initial_capacity() {
        let mut slab = Slab::with_capacity(1);
        let (a, _) = slab.alloc(1u32, 0);
        let (b, _) = slab.alloc(2u32, 0);
        assert_ne!(a, b);
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.capacity(), 2);
    }

    #[test]
    fn free_returns_payload_and_bumps_generation() {
        let mut slab = Slab::with_capacity(1);
        let (idx, node) = slab.alloc(String::from("x"), 7);
        let first_generation = node.generation;
        assert_eq!(slab.free(idx), Some(Some(String::from("x"))));
        assert_eq!(slab.free(idx), None, "double free is rejected");

        let (again, node) = slab.alloc(String::from("y"), 9);
        assert_eq!(again, idx, "freed slot is recycled");
        assert_eq!(node.generation, first_generation + 1);
    }
}
