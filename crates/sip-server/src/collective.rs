//! Collective operations among the server processes of one job.
//!
//! Every member must make the same sequence of collective calls. A member
//! that skips a call stalls the rest of the group at that call.

use parking_lot::Mutex;
use sip_error::{Result, SipError};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

/// Group communication primitives used by collective file I/O.
pub trait Collective: Send + Sync + fmt::Debug {
    /// Position of this process in the group, `0..size()`.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Block until every member has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Maximum of `value` over the group.
    fn all_reduce_max(&self, value: u64) -> Result<u64>;

    /// Element-wise maximum of `values` over the group, written back into
    /// `values`. Every member must pass a slice of the same length.
    fn all_reduce_max_in_place(&self, values: &mut [i64]) -> Result<()>;
}

// ── SingleProcess ───────────────────────────────────────────────────────────

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_max(&self, value: u64) -> Result<u64> {
        Ok(value)
    }

    fn all_reduce_max_in_place(&self, _values: &mut [i64]) -> Result<()> {
        Ok(())
    }
}

// ── LocalCollective ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct GroupShared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<i64>>>,
}

/// One member of a thread-based group. Each member thread owns one.
#[derive(Debug)]
pub struct LocalCollective {
    rank: usize,
    size: usize,
    shared: Arc<GroupShared>,
    barrier_calls: AtomicUsize,
}

impl LocalCollective {
    /// Create the members of a group of `size` threads, ordered by rank.
    #[must_use]
    pub fn group(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                shared: Arc::clone(&shared),
                barrier_calls: AtomicUsize::new(0),
            })
            .collect()
    }

    /// Barriers this member has entered, including those inside reductions.
    #[must_use]
    pub fn barrier_calls(&self) -> usize {
        self.barrier_calls.load(Ordering::Relaxed)
    }

    fn wait(&self) {
        self.barrier_calls.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.barrier.wait();
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        self.wait();
        Ok(())
    }

    fn all_reduce_max(&self, value: u64) -> Result<u64> {
        let mut values = [i64::try_from(value)
            .map_err(|_| SipError::Collective(format!("{value} does not fit i64")))?];
        self.all_reduce_max_in_place(&mut values)?;
        u64::try_from(values[0])
            .map_err(|_| SipError::Collective(format!("negative maximum {}", values[0])))
    }

    fn all_reduce_max_in_place(&self, values: &mut [i64]) -> Result<()> {
        self.shared.slots.lock()[self.rank] = values.to_vec();
        self.wait();
        let reduced = {
            let slots = self.shared.slots.lock();
            if slots.iter().any(|slot| slot.len() != values.len()) {
                Err(SipError::Collective(format!(
                    "all_reduce_max length mismatch at rank {}",
                    self.rank
                )))
            } else {
                for (i, value) in values.iter_mut().enumerate() {
                    *value = slots.iter().map(|slot| slot[i]).fold(*value, i64::max);
                }
                Ok(())
            }
        };
        // Slots must not be rewritten until every member has read them.
        self.wait();
        reduced
    }
}
