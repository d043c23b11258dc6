//! Two-level block map: array id, then block id within that array.
//!
//! Per-array maps are created lazily on first access and can be detached
//! and re-attached whole, which is how persistent arrays move between the
//! live map and a saved set without touching individual blocks.

use crate::block::BlockFootprint;
use sip_error::{Result, SipError};
use sip_types::{ArrayId, BlockId};
use std::collections::BTreeMap;
use std::collections::btree_map;
use tracing::{trace, warn};

/// Blocks of one array, ordered by [`BlockId`].
pub type PerArrayMap<T> = BTreeMap<BlockId, T>;

/// Map from [`BlockId`] to `T`, partitioned by array.
#[derive(Debug)]
pub struct IdBlockMap<T> {
    block_map: Vec<Option<PerArrayMap<T>>>,
}

impl<T> Default for IdBlockMap<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> IdBlockMap<T> {
    /// Map sized for `num_arrays` arrays. Larger array ids grow the map.
    #[must_use]
    pub fn new(num_arrays: usize) -> Self {
        let mut block_map = Vec::with_capacity(num_arrays);
        block_map.resize_with(num_arrays, || None);
        Self { block_map }
    }

    /// Number of array slots, populated or not.
    #[must_use]
    pub fn num_arrays(&self) -> usize {
        self.block_map.len()
    }

    fn array_map(&self, array_id: ArrayId) -> Option<&PerArrayMap<T>> {
        self.block_map.get(array_id.index()).and_then(Option::as_ref)
    }

    fn array_map_mut(&mut self, array_id: ArrayId) -> Option<&mut PerArrayMap<T>> {
        self.block_map
            .get_mut(array_id.index())
            .and_then(Option::as_mut)
    }

    /// Lookup without creating.
    #[must_use]
    pub fn block(&self, id: &BlockId) -> Option<&T> {
        self.array_map(id.array_id())?.get(id)
    }

    pub fn block_mut(&mut self, id: &BlockId) -> Option<&mut T> {
        self.array_map_mut(id.array_id())?.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.block(id).is_some()
    }

    /// Whether [`insert_block`](Self::insert_block) would accept `id`.
    pub fn check_insert(&self, id: &BlockId) -> Result<()> {
        let Some(map) = self.array_map(id.array_id()) else {
            return Ok(());
        };
        if map.contains_key(id) {
            return Err(SipError::DuplicateBlock(id.to_string()));
        }
        if let Some(existing) = self.overlapping_ranges(id).next() {
            return Err(SipError::OverlappingRange {
                new: id.to_string(),
                existing: existing.to_string(),
            });
        }
        Ok(())
    }

    /// Contiguous entries of `id`'s array intersecting `id`, when `id` is a
    /// contiguous range itself.
    pub fn overlapping_ranges<'a>(
        &'a self,
        id: &'a BlockId,
    ) -> impl Iterator<Item = &'a BlockId> {
        self.iter_array(id.array_id())
            .map(|(other, _)| other)
            .filter(move |other| {
                id.is_contiguous_local() && other.is_contiguous_local() && other.overlaps(id)
            })
    }

    /// Insert a new entry.
    ///
    /// Fails with `DuplicateBlock` if `id` is already present, and with
    /// `OverlappingRange` if `id` is a contiguous range intersecting another
    /// contiguous range of the same array.
    pub fn insert_block(&mut self, id: BlockId, value: T) -> Result<()> {
        self.check_insert(&id)?;
        let map = self.per_array_map(id.array_id());
        match map.entry(id) {
            btree_map::Entry::Occupied(entry) => {
                Err(SipError::DuplicateBlock(entry.key().to_string()))
            }
            btree_map::Entry::Vacant(entry) => {
                trace!(block = %entry.key(), "insert_block");
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Remove and return an entry that must exist.
    pub fn get_and_remove_block(&mut self, id: &BlockId) -> Result<T> {
        self.array_map_mut(id.array_id())
            .and_then(|map| map.remove(id))
            .ok_or_else(|| SipError::BlockNotFound(id.to_string()))
    }

    /// Remove and drop an entry. Returns whether it was present.
    pub fn delete_block(&mut self, id: &BlockId) -> bool {
        trace!(block = %id, "delete_block");
        self.array_map_mut(id.array_id())
            .and_then(|map| map.remove(id))
            .is_some()
    }

    /// The map of one array, created empty on first access.
    pub fn per_array_map(&mut self, array_id: ArrayId) -> &mut PerArrayMap<T> {
        let index = array_id.index();
        if index >= self.block_map.len() {
            self.block_map.resize_with(index + 1, || None);
        }
        self.block_map[index].get_or_insert_with(BTreeMap::new)
    }

    /// Entries of one array in id order; empty if the array has none.
    pub fn iter_array(&self, array_id: ArrayId) -> impl Iterator<Item = (&BlockId, &T)> {
        self.array_map(array_id).into_iter().flatten()
    }

    /// Drop the map of one array and every entry in it.
    pub fn delete_per_array_map(&mut self, array_id: ArrayId) {
        if let Some(slot) = self.block_map.get_mut(array_id.index()) {
            *slot = None;
        }
    }

    /// Detach the map of one array. Returns an empty map if none existed.
    pub fn get_and_remove_per_array_map(&mut self, array_id: ArrayId) -> PerArrayMap<T> {
        self.block_map
            .get_mut(array_id.index())
            .and_then(Option::take)
            .unwrap_or_default()
    }

    /// Attach `map` as the map of `array_id`, rewriting the array id carried
    /// in every key. A non-empty map already present is dropped.
    pub fn insert_per_array_map(&mut self, array_id: ArrayId, map: PerArrayMap<T>) {
        let rewritten: PerArrayMap<T> = map
            .into_iter()
            .map(|(mut id, value)| {
                id.set_array_id(array_id);
                (id, value)
            })
            .collect();
        let slot = self.per_array_map(array_id);
        if !slot.is_empty() {
            warn!(
                array = array_id.0,
                replaced = slot.len(),
                "insert_per_array_map replacing a non-empty map"
            );
        }
        *slot = rewritten;
    }

    /// Number of entries across all arrays.
    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.block_map.iter().flatten().map(BTreeMap::len).sum()
    }

    /// Array ids with at least one entry, ascending.
    pub fn populated_arrays(&self) -> impl Iterator<Item = ArrayId> + '_ {
        self.block_map
            .iter()
            .enumerate()
            .filter(|(_, map)| map.as_ref().is_some_and(|m| !m.is_empty()))
            .filter_map(|(index, _)| u32::try_from(index).ok().map(ArrayId))
    }

    /// A contiguous entry of `id`'s array whose range encloses `id`.
    ///
    /// Scans every entry of the array.
    #[must_use]
    pub fn enclosing_contiguous(&self, id: &BlockId) -> Option<(&BlockId, &T)> {
        self.iter_array(id.array_id())
            .find(|(candidate, _)| candidate.is_contiguous_local() && candidate.encloses(id))
    }
}

impl<T: BlockFootprint> IdBlockMap<T> {
    /// Drop every entry of one array. Returns the data bytes released.
    pub fn delete_per_array_map_and_blocks(&mut self, array_id: ArrayId) -> usize {
        let map = self.get_and_remove_per_array_map(array_id);
        map.values().map(BlockFootprint::data_bytes).sum()
    }
}
