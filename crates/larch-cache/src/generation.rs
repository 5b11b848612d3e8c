//! Access clock used to rank nodes for eviction.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter handed to nodes when they are accessed.
///
/// One instance belongs to each environment, so independent environments in
/// the same process do not share eviction order.
#[derive(Debug, Default)]
pub struct Generation {
    next: AtomicU64,
}

impl Generation {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next generation value.
    pub fn next_generation(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the current value without advancing.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_increases() {
        let gen = Generation::new();
        let a = gen.next_generation();
        let b = gen.next_generation();
        assert!(b > a);
        assert_eq!(gen.current(), b + 1);
    }

    #[test]
    fn test_independent_clocks() {
        let a = Generation::new();
        let b = Generation::new();
        a.next_generation();
        a.next_generation();
        assert_eq!(b.next_generation(), 0);
    }
}
