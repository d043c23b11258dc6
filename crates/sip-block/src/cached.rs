//! Worker-side block map with a memory budget.
//!
//! A block lives in one of four places:
//!
//! - **active**: in the primary map, in use by the current computation;
//! - **cached**: demoted by [`CachedBlockMap::cached_delete_block`], still
//!   resident but reclaimable under memory pressure;
//! - **pending delete**: removed from both maps while a transfer still
//!   touches its buffer, reclaimed once the transfer completes;
//! - **freed**: dropped, its bytes returned to the [`MemoryTracker`].
//!
//! [`CachedBlockMap::allocate_data`] is the only way block data enters the
//! budget. When an allocation would exceed `max_allocatable_bytes` the map
//! reclaims space in this order: completed pending deletes, then LRU cache
//! victims, then a blocking wait on a pending delete.

use crate::block::{Block, BlockFootprint};
use crate::id_block_map::{IdBlockMap, PerArrayMap};
use crate::memory::MemoryTracker;
use crate::policy::LruArrayPolicy;
use serde::{Deserialize, Serialize};
use sip_error::{Result, SipError};
use sip_types::{ArrayId, BlockId, BlockShape};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const DOUBLE_BYTES: usize = std::mem::size_of::<f64>();

/// Default worker budget: 2 GiB.
pub const DEFAULT_MAX_ALLOCATABLE_BYTES: usize = 2 << 30;

// ── Options ─────────────────────────────────────────────────────────────────

/// Worker cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Upper bound on bytes of block data held by this process.
    pub max_allocatable_bytes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_allocatable_bytes: DEFAULT_MAX_ALLOCATABLE_BYTES,
        }
    }
}

impl CacheOptions {
    /// Parse and validate options from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| SipError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_allocatable_bytes == 0 {
            return Err(SipError::Config(
                "max_allocatable_bytes must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

// ── CachedBlockMap ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CachedBlockMap {
    block_map: IdBlockMap<Block>,
    cache: IdBlockMap<Block>,
    policy: LruArrayPolicy,
    pending_delete: VecDeque<Block>,
    pending_delete_bytes: usize,
    tracker: Arc<MemoryTracker>,
    max_allocatable_bytes: usize,
    max_allocatable_bytes_set: bool,
}

impl CachedBlockMap {
    pub fn new(num_arrays: usize, options: CacheOptions) -> Result<Self> {
        Self::with_tracker(num_arrays, options, Arc::new(MemoryTracker::new()))
    }

    /// Map accounting through a tracker shared with other components.
    pub fn with_tracker(
        num_arrays: usize,
        options: CacheOptions,
        tracker: Arc<MemoryTracker>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            block_map: IdBlockMap::new(num_arrays),
            cache: IdBlockMap::new(num_arrays),
            policy: LruArrayPolicy::new(),
            pending_delete: VecDeque::new(),
            pending_delete_bytes: 0,
            tracker,
            max_allocatable_bytes: options.max_allocatable_bytes,
            max_allocatable_bytes_set: false,
        })
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn max_allocatable_bytes(&self) -> usize {
        self.max_allocatable_bytes
    }

    /// Replace the budget. Allowed once per map.
    pub fn set_max_allocatable_bytes(&mut self, bytes: usize) -> Result<()> {
        if self.max_allocatable_bytes_set {
            return Err(SipError::InvalidState(
                "max_allocatable_bytes may only be set once".to_owned(),
            ));
        }
        if bytes == 0 {
            return Err(SipError::Config(
                "max_allocatable_bytes must be > 0".to_owned(),
            ));
        }
        self.max_allocatable_bytes = bytes;
        self.max_allocatable_bytes_set = true;
        Ok(())
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.tracker.get_allocated_bytes()
    }

    #[must_use]
    pub fn pending_delete_bytes(&self) -> usize {
        self.pending_delete_bytes
    }

    #[must_use]
    pub fn pending_list_size(&self) -> usize {
        self.pending_delete.len()
    }

    /// Active plus cached blocks.
    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.block_map.total_blocks() + self.cache.total_blocks()
    }

    #[must_use]
    pub fn is_active(&self, id: &BlockId) -> bool {
        self.block_map.contains(id)
    }

    #[must_use]
    pub fn is_cached(&self, id: &BlockId) -> bool {
        self.cache.contains(id)
    }

    /// Active block `id`, promoting it from the cache if needed. A block
    /// that cannot be promoted stays cached.
    pub fn block(&mut self, id: &BlockId) -> Result<Option<&mut Block>> {
        if !self.block_map.contains(id) {
            if !self.cache.contains(id) {
                return Ok(None);
            }
            self.block_map.check_insert(id)?;
            let block = self.cache.get_and_remove_block(id)?;
            trace!(block = %id, "promote cached block");
            self.block_map.insert_block(id.clone(), block)?;
        }
        Ok(self.block_map.block_mut(id))
    }

    /// Insert an active block. Cached copies of `id`, and cached ranges
    /// overlapping it, are dropped.
    pub fn insert_block(&mut self, id: BlockId, block: Block) -> Result<()> {
        self.block_map.check_insert(&id)?;
        let mut stale: Vec<BlockId> = self.cache.overlapping_ranges(&id).cloned().collect();
        if self.cache.contains(&id) {
            stale.push(id.clone());
        }
        for stale_id in stale {
            let cached = self.cache.get_and_remove_block(&stale_id)?;
            trace!(block = %stale_id, new = %id, "dropped stale cached copy");
            self.retire(cached);
        }
        self.block_map.insert_block(id, block)
    }

    /// Demote an active block into the cache and mark its array as most
    /// recently used.
    pub fn cached_delete_block(&mut self, id: &BlockId) -> Result<()> {
        let block = self.block_map.get_and_remove_block(id)?;
        self.policy.touch(id);
        self.cache.insert_block(id.clone(), block)
    }

    /// Remove an active block for good. A block whose transfer is still in
    /// flight is parked on the pending-delete list.
    pub fn delete_block(&mut self, id: &BlockId) -> Result<()> {
        let block = self.block_map.get_and_remove_block(id)?;
        self.retire(block);
        Ok(())
    }

    fn retire(&mut self, mut block: Block) {
        if block.test() {
            drop(block);
        } else {
            self.pending_delete_bytes += block.data_bytes();
            self.pending_delete.push_back(block);
        }
    }

    /// Drop pending-delete blocks whose transfers have completed. Never
    /// blocks. Returns the bytes released.
    pub fn clean_pending(&mut self) -> usize {
        let mut reclaimed = 0;
        self.pending_delete.retain_mut(|block| {
            if block.test() {
                reclaimed += block.data_bytes();
                false
            } else {
                true
            }
        });
        self.pending_delete_bytes = self.pending_delete_bytes.saturating_sub(reclaimed);
        reclaimed
    }

    /// Tracked, zeroed buffer of `num_doubles` elements within the budget.
    ///
    /// Buffers are always zero-filled; `initialize` only records intent.
    pub fn allocate_data(&mut self, num_doubles: usize, initialize: bool) -> Result<Vec<f64>> {
        let budget = self.max_allocatable_bytes;
        let Some(needed) = num_doubles.checked_mul(DOUBLE_BYTES) else {
            return Err(SipError::OutOfMemory {
                requested: usize::MAX,
                budget,
                allocated: self.allocated_bytes(),
            });
        };
        let mut to_free = 0;
        loop {
            let overage = self
                .allocated_bytes()
                .saturating_add(needed)
                .saturating_sub(budget);
            let request = overage.max(to_free);
            let mut freed_enough = true;
            if request > 0 {
                let freed = self.free_up_bytes_in_cache(request);
                freed_enough = freed >= request;
                let allocated = self.allocated_bytes();
                if allocated.saturating_add(needed) > budget {
                    return Err(SipError::OutOfMemory {
                        requested: needed,
                        budget,
                        allocated,
                    });
                }
            }

            let mut data = Vec::new();
            if data.try_reserve_exact(num_doubles).is_ok() {
                data.resize(num_doubles, 0.0);
                self.tracker.inc_allocated(num_doubles);
                trace!(num_doubles, initialize, "allocate_data");
                return Ok(data);
            }
            if !freed_enough || to_free >= needed.max(self.cache_bytes()) {
                return Err(SipError::OutOfMemory {
                    requested: needed,
                    budget,
                    allocated: self.allocated_bytes(),
                });
            }
            to_free = needed.max(to_free.saturating_mul(2));
            debug!(to_free, "allocation failed, freeing more cache");
        }
    }

    fn cache_bytes(&self) -> usize {
        self.cache
            .populated_arrays()
            .flat_map(|array| self.cache.iter_array(array))
            .map(|(_, block)| block.data_bytes())
            .sum()
    }

    /// Reclaim at least `requested_bytes` if possible. Returns the bytes
    /// actually released, which may fall short.
    pub fn free_up_bytes_in_cache(&mut self, requested_bytes: usize) -> usize {
        let mut freed = 0;
        while freed < requested_bytes {
            let reclaimed = self.clean_pending();
            if reclaimed > 0 {
                freed += reclaimed;
                continue;
            }

            if let Ok(victim) = self.policy.get_next_block_for_removal(&self.cache) {
                if let Ok(mut block) = self.cache.get_and_remove_block(&victim) {
                    let bytes = block.data_bytes();
                    debug!(block = %victim, bytes, "evict cached block");
                    if block.test() {
                        drop(block);
                        freed += bytes;
                    } else {
                        self.pending_delete_bytes += bytes;
                        self.pending_delete.push_back(block);
                    }
                }
                continue;
            }

            if let Some(mut block) = self.pending_delete.pop_front() {
                block.wait();
                let bytes = block.data_bytes();
                self.pending_delete_bytes = self.pending_delete_bytes.saturating_sub(bytes);
                drop(block);
                freed += bytes;
                continue;
            }

            warn!(
                requested_bytes,
                freed, "no cached or pending blocks left to free"
            );
            break;
        }
        freed
    }

    /// New tracked block of `shape` allocated within the budget.
    pub fn create_block(&mut self, shape: BlockShape, initialize: bool) -> Result<Block> {
        let data = self.allocate_data(shape.num_elems(), initialize)?;
        Ok(Block::tracked(shape, data, Arc::clone(&self.tracker)))
    }

    /// Drop every active and cached block of one array. Returns the bytes
    /// released.
    pub fn delete_per_array_map_and_blocks(&mut self, array_id: ArrayId) -> usize {
        self.policy.remove_all_blocks_for_array(array_id);
        self.block_map.delete_per_array_map_and_blocks(array_id)
            + self.cache.delete_per_array_map_and_blocks(array_id)
    }

    /// Attach a whole array of active blocks; cached blocks of the array are
    /// dropped.
    pub fn insert_per_array_map(&mut self, array_id: ArrayId, map: PerArrayMap<Block>) {
        self.purge_cached_array(array_id);
        self.block_map.insert_per_array_map(array_id, map);
    }

    /// Detach the active blocks of one array; cached blocks of the array are
    /// dropped.
    pub fn get_and_remove_per_array_map(&mut self, array_id: ArrayId) -> PerArrayMap<Block> {
        self.purge_cached_array(array_id);
        self.block_map.get_and_remove_per_array_map(array_id)
    }

    fn purge_cached_array(&mut self, array_id: ArrayId) {
        self.policy.remove_all_blocks_for_array(array_id);
        let _ = self.cache.delete_per_array_map_and_blocks(array_id);
    }
}
