//! Per-adaptor committed offset

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic position marker for one adaptor.
///
/// Only moves upward; concurrent commits merge with max.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    committed: AtomicU64,
}

impl OffsetTracker {
    pub fn new(start: u64) -> Self {
        Self {
            committed: AtomicU64::new(start),
        }
    }

    pub fn get(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Record a commit; returns true if the offset advanced
    pub fn advance(&self, offset: u64) -> bool {
        self.committed.fetch_max(offset, Ordering::SeqCst) < offset
    }
}
