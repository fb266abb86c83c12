//! Command identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier of a submitted command.
///
/// Invariant: issued once by a [`SequenceAllocator`]; consumers echo it back
/// verbatim in their replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(u64);

impl CommandId {
    /// Raw value for wire serialization.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CommandId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<CommandId> for u64 {
    fn from(id: CommandId) -> Self {
        id.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues monotonically increasing command ids, starting at 1.
///
/// Wrapping would take 2^64 submissions and is treated as unreachable.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id.
    pub fn next(&self) -> CommandId {
        CommandId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_at_one_and_increases() {
        let seq = SequenceAllocator::new();
        assert_eq!(seq.next(), CommandId::from(1));
        assert_eq!(seq.next(), CommandId::from(2));
    }

    #[test]
    fn concurrent_ids_are_unique() {
        let seq = Arc::new(SequenceAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(CommandId::from(42).to_string(), "#42");
    }
}
