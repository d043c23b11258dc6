//! Least-recently-used eviction at array granularity.
//!
//! Recency is tracked per array, so bookkeeping is bounded by the number of
//! arrays rather than the number of blocks. The victim within the coldest
//! array is its first block in map order.

use crate::id_block_map::IdBlockMap;
use sip_error::{Result, SipError};
use sip_types::{ArrayId, BlockId};
use std::collections::VecDeque;
use tracing::trace;

/// Recency list of arrays; the front is the most recently used.
#[derive(Debug, Default, Clone)]
pub struct LruArrayPolicy {
    lru_list: VecDeque<ArrayId>,
}

impl LruArrayPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the array owning `id` as most recently used.
    pub fn touch(&mut self, id: &BlockId) {
        self.touch_array(id.array_id());
    }

    pub fn touch_array(&mut self, array_id: ArrayId) {
        self.remove_all_blocks_for_array(array_id);
        self.lru_list.push_front(array_id);
    }

    /// Forget `array_id` entirely.
    pub fn remove_all_blocks_for_array(&mut self, array_id: ArrayId) {
        if let Some(pos) = self.lru_list.iter().position(|&a| a == array_id) {
            self.lru_list.remove(pos);
        }
    }

    /// Arrays in recency order, most recent first.
    pub fn arrays(&self) -> impl Iterator<Item = ArrayId> + '_ {
        self.lru_list.iter().copied()
    }

    /// Whether any tracked array still holds a block in `map`. Arrays found
    /// empty along the way are dropped from the list.
    pub fn any_blocks_for_removal<T>(&mut self, map: &IdBlockMap<T>) -> bool {
        while let Some(&array_id) = self.lru_list.back() {
            if map.iter_array(array_id).next().is_some() {
                return true;
            }
            self.lru_list.pop_back();
        }
        false
    }

    /// The first block of the least recently used array that has one.
    ///
    /// Fails with `NoBlocksToEvict` once the list is exhausted.
    pub fn get_next_block_for_removal<T>(&mut self, map: &IdBlockMap<T>) -> Result<BlockId> {
        self.get_next_block_for_removal_where(map, |_, _| true)
    }

    /// Like [`get_next_block_for_removal`](Self::get_next_block_for_removal),
    /// but only blocks accepted by `eligible` are offered. Arrays without an
    /// eligible block are dropped from the list.
    pub fn get_next_block_for_removal_where<T, F>(
        &mut self,
        map: &IdBlockMap<T>,
        mut eligible: F,
    ) -> Result<BlockId>
    where
        F: FnMut(&BlockId, &T) -> bool,
    {
        while let Some(&array_id) = self.lru_list.back() {
            if let Some((id, _)) = map
                .iter_array(array_id)
                .find(|&(id, value)| eligible(id, value))
            {
                trace!(block = %id, "eviction victim");
                return Ok(id.clone());
            }
            self.lru_list.pop_back();
        }
        Err(SipError::NoBlocksToEvict)
    }
}
