//! Process-wide accounting of bytes held by block data.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

const DOUBLE_BYTES: usize = std::mem::size_of::<f64>();

/// Counts bytes currently allocated for block data.
///
/// One tracker is created per process role and shared by handle with the
/// maps and blocks that allocate through it.
#[derive(Default)]
pub struct MemoryTracker {
    allocated_bytes: AtomicUsize,
}

impl MemoryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `num_doubles` newly allocated elements. Saturates at `usize::MAX`.
    pub fn inc_allocated(&self, num_doubles: usize) {
        let bytes = num_doubles.saturating_mul(DOUBLE_BYTES);
        let _ = self
            .allocated_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(bytes))
            });
    }

    /// Record `num_doubles` released elements. Saturates at zero.
    pub fn dec_allocated(&self, num_doubles: usize) {
        let bytes = num_doubles.saturating_mul(DOUBLE_BYTES);
        let _ = self
            .allocated_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn reset(&self) {
        self.allocated_bytes.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("allocated_bytes", &self.get_allocated_bytes())
            .finish()
    }
}
