//! Server-side block map that spills chunks to per-array files.
//!
//! Every served array has a [`ChunkManager`] over its own [`ArrayFile`].
//! Block data lives in chunks; when an allocation would exceed
//! `max_allocatable_bytes` the map writes whole chunks of the least
//! recently used arrays to disk and drops their buffers. A request for a
//! block whose chunk was paged out reads the chunk back before returning.
//!
//! Persistence hands a whole array file, with a block-number index, to a
//! label. Restoring the label swaps that file in as the array's backing
//! store, reading every chunk up front or on first access.
//!
//! # Collective operations
//!
//! Construction, [`save_persistent_array`](DiskBackedBlockMap::save_persistent_array)
//! and [`restore_persistent_array`](DiskBackedBlockMap::restore_persistent_array)
//! must be called by every server of the group in the same order.

use crate::array_file::{ABSENT_OFFSET, ArrayFile};
use crate::catalog::{ArrayCatalog, DataDistribution};
use crate::chunk::{Chunk, ChunkManager};
use crate::collective::Collective;
use crate::server_block::{DiskBackingState, ServerBlock, ServerBlockMut};
use serde::{Deserialize, Serialize};
use sip_block::{DEFAULT_MAX_ALLOCATABLE_BYTES, IdBlockMap, LruArrayPolicy, PerArrayMap};
use sip_error::{Result, SipError};
use sip_types::{ArrayId, BlockId, MessageType, SectionNumber, WorkerId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const DOUBLE_BYTES: usize = std::mem::size_of::<f64>();

/// Default chunk size in doubles (8 MiB of data).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

// ── Options ─────────────────────────────────────────────────────────────────

/// Server map configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Upper bound on bytes of chunk data held in memory.
    pub max_allocatable_bytes: usize,
    /// Doubles per chunk.
    pub chunk_size: usize,
    /// Directory for array files. `None` keeps them in memory, which only
    /// works for a single server.
    pub scratch_dir: Option<PathBuf>,
    /// Restore persistent arrays on first access instead of up front.
    pub lazy_restore: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_allocatable_bytes: DEFAULT_MAX_ALLOCATABLE_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_dir: None,
            lazy_restore: false,
        }
    }
}

impl ServerOptions {
    /// Parse and validate options from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| SipError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || i32::try_from(self.chunk_size).is_err() {
            return Err(SipError::Config(format!(
                "chunk_size {} must be in 1..=i32::MAX",
                self.chunk_size
            )));
        }
        let chunk_bytes = self.chunk_size.saturating_mul(DOUBLE_BYTES);
        if self.max_allocatable_bytes < chunk_bytes {
            return Err(SipError::Config(format!(
                "max_allocatable_bytes {} cannot hold one chunk of {chunk_bytes} bytes",
                self.max_allocatable_bytes
            )));
        }
        Ok(())
    }
}

/// Blocks of one array detached from the map, with the chunks holding
/// their data.
#[derive(Debug)]
pub struct ServedArray {
    pub blocks: PerArrayMap<ServerBlock>,
    pub chunks: ChunkManager,
}

// ── DiskBackedBlockMap ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DiskBackedBlockMap {
    options: ServerOptions,
    catalog: Arc<dyn ArrayCatalog>,
    collective: Arc<dyn Collective>,
    distribution: DataDistribution,
    block_map: IdBlockMap<ServerBlock>,
    managers: Vec<Option<ChunkManager>>,
    policy: LruArrayPolicy,
    saved: HashMap<String, ArrayFile>,
    generation: u64,
    allocated_doubles: usize,
    max_allocatable_doubles: usize,
    max_allocatable_bytes_set: bool,
}

impl DiskBackedBlockMap {
    /// Collectively create the map and one array file per catalog array.
    pub fn new(
        options: ServerOptions,
        catalog: Arc<dyn ArrayCatalog>,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        options.validate()?;
        if options.scratch_dir.is_none() && collective.size() > 1 {
            return Err(SipError::Config(
                "a scratch_dir is required when more than one server shares array files"
                    .to_owned(),
            ));
        }
        let num_arrays = catalog.num_arrays();
        let mut map = Self {
            max_allocatable_doubles: options.max_allocatable_bytes / DOUBLE_BYTES,
            distribution: DataDistribution::new(collective.size()),
            block_map: IdBlockMap::new(num_arrays),
            managers: Vec::with_capacity(num_arrays),
            policy: LruArrayPolicy::new(),
            saved: HashMap::new(),
            generation: 0,
            allocated_doubles: 0,
            max_allocatable_bytes_set: false,
            options,
            catalog,
            collective,
        };
        for index in 0..num_arrays {
            let array_id = u32::try_from(index)
                .map(ArrayId)
                .map_err(|_| SipError::Config("too many arrays".to_owned()))?;
            let manager = map.new_manager(array_id)?;
            map.managers.push(Some(manager));
        }
        debug!(
            rank = map.collective.rank(),
            arrays = num_arrays,
            max_doubles = map.max_allocatable_doubles,
            "disk-backed block map ready"
        );
        Ok(map)
    }

    fn new_manager(&mut self, array_id: ArrayId) -> Result<ChunkManager> {
        let collective = Arc::clone(&self.collective);
        let file = match &self.options.scratch_dir {
            Some(dir) => {
                let path = dir.join(format!("array_{}.{}.dat", array_id.0, self.generation));
                ArrayFile::create(path, self.options.chunk_size, collective)?
            }
            None => ArrayFile::in_memory(self.options.chunk_size, collective)?,
        };
        self.generation += 1;
        Ok(ChunkManager::new(file))
    }

    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn ArrayCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    #[must_use]
    pub fn distribution(&self) -> DataDistribution {
        self.distribution
    }

    /// Whether this server holds `id` under the round-robin distribution.
    pub fn is_my_block(&self, id: &BlockId) -> Result<bool> {
        let block_number = self.catalog.block_number(id)?;
        Ok(self.distribution.is_my_block(block_number, self.rank()))
    }

    #[must_use]
    pub fn allocated_doubles(&self) -> usize {
        self.allocated_doubles
    }

    #[must_use]
    pub fn max_allocatable_doubles(&self) -> usize {
        self.max_allocatable_doubles
    }

    #[must_use]
    pub fn remaining_doubles(&self) -> usize {
        self.max_allocatable_doubles
            .saturating_sub(self.allocated_doubles)
    }

    /// Replace the budget. Allowed once per map.
    pub fn set_max_allocatable_bytes(&mut self, bytes: usize) -> Result<()> {
        if self.max_allocatable_bytes_set {
            return Err(SipError::InvalidState(
                "max_allocatable_bytes may only be set once".to_owned(),
            ));
        }
        let options = ServerOptions {
            max_allocatable_bytes: bytes,
            ..self.options.clone()
        };
        options.validate()?;
        self.options = options;
        self.max_allocatable_doubles = bytes / DOUBLE_BYTES;
        self.max_allocatable_bytes_set = true;
        Ok(())
    }

    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.block_map.total_blocks()
    }

    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.block_map.contains(id)
    }

    #[must_use]
    pub fn block(&self, id: &BlockId) -> Option<&ServerBlock> {
        self.block_map.block(id)
    }

    #[must_use]
    pub fn chunk_manager(&self, array_id: ArrayId) -> Option<&ChunkManager> {
        self.managers.get(array_id.index()).and_then(Option::as_ref)
    }

    /// Whether a persistent array is stored under `label`.
    #[must_use]
    pub fn has_persistent_array(&self, label: &str) -> bool {
        self.saved.contains_key(label)
    }

    fn manager_mut(&mut self, array_id: ArrayId) -> Result<&mut ChunkManager> {
        self.managers
            .get_mut(array_id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| no_manager(array_id))
    }

    fn manager(&self, array_id: ArrayId) -> Result<&ChunkManager> {
        self.chunk_manager(array_id)
            .ok_or_else(|| no_manager(array_id))
    }

    fn existing(&self, id: &BlockId) -> Result<&ServerBlock> {
        self.block_map
            .block(id)
            .ok_or_else(|| SipError::BlockNotFound(id.to_string()))
    }

    // ── Memory ──────────────────────────────────────────────────────────────

    /// Reserve `num_doubles` of the budget, paging chunks out first if the
    /// reservation would not fit.
    pub fn allocate_data(&mut self, num_doubles: usize) -> Result<()> {
        if num_doubles == 0 {
            return Ok(());
        }
        let wanted = self.allocated_doubles.saturating_add(num_doubles);
        if wanted > self.max_allocatable_doubles {
            let overage = wanted - self.max_allocatable_doubles;
            let freed = self.backup_and_free_doubles(overage)?;
            if freed < overage {
                warn!(
                    requested = overage,
                    freed, "backup_and_free_doubles fell short"
                );
            }
        }
        if self.allocated_doubles.saturating_add(num_doubles) > self.max_allocatable_doubles {
            return Err(SipError::OutOfMemory {
                requested: num_doubles.saturating_mul(DOUBLE_BYTES),
                budget: self.max_allocatable_doubles * DOUBLE_BYTES,
                allocated: self.allocated_doubles * DOUBLE_BYTES,
            });
        }
        self.allocated_doubles += num_doubles;
        Ok(())
    }

    /// Return `num_doubles` to the budget.
    pub fn free_data(&mut self, num_doubles: usize) {
        self.allocated_doubles = self.allocated_doubles.saturating_sub(num_doubles);
    }

    /// Page chunks out, least recently used array first, until at least
    /// `requested` doubles are freed or nothing resident is left. Returns
    /// the doubles freed.
    pub fn backup_and_free_doubles(&mut self, requested: usize) -> Result<usize> {
        let mut freed = 0;
        while freed < requested {
            let managers = &self.managers;
            let victim = match self
                .policy
                .get_next_block_for_removal_where(&self.block_map, |id, block| {
                    managers
                        .get(id.array_id().index())
                        .and_then(Option::as_ref)
                        .and_then(|manager| manager.chunk(block.chunk_number()))
                        .is_some_and(Chunk::in_memory)
                }) {
                Ok(id) => id,
                Err(SipError::NoBlocksToEvict) => break,
                Err(e) => return Err(e),
            };
            let chunk_number = self.existing(&victim)?.chunk_number();
            freed += self.page_out_chunk(victim.array_id(), chunk_number)?;
        }
        Ok(freed)
    }

    fn page_out_chunk(&mut self, array_id: ArrayId, chunk_number: usize) -> Result<usize> {
        let Self {
            managers,
            block_map,
            ..
        } = self;
        let manager = managers
            .get_mut(array_id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| no_manager(array_id))?;
        let blocks = block_map.per_array_map(array_id);
        manager.wait_all(chunk_number, blocks)?;
        if !manager.chunk(chunk_number).is_some_and(Chunk::valid_on_disk) {
            manager.write_chunk(chunk_number)?;
        }
        let freed = manager.delete_chunk_data(chunk_number)?;
        for id in manager.chunk(chunk_number).map_or(&[][..], Chunk::blocks) {
            if let Some(block) = blocks.get_mut(id) {
                block.disk_state = DiskBackingState {
                    in_memory: false,
                    on_disk: true,
                    dirty: false,
                };
            }
        }
        self.free_data(freed);
        debug!(array = array_id.0, chunk_number, freed, "backed up chunk");
        Ok(freed)
    }

    fn mark_chunk_resident(&mut self, array_id: ArrayId, chunk_number: usize) {
        let Self {
            managers,
            block_map,
            ..
        } = self;
        let Some(chunk) = managers
            .get(array_id.index())
            .and_then(Option::as_ref)
            .and_then(|manager| manager.chunk(chunk_number))
        else {
            return;
        };
        let blocks = block_map.per_array_map(array_id);
        for id in chunk.blocks() {
            if let Some(block) = blocks.get_mut(id) {
                block.disk_state.in_memory = true;
                block.disk_state.on_disk = true;
            }
        }
    }

    /// Read a paged-out chunk back into memory.
    pub fn read_chunk_from_disk(&mut self, array_id: ArrayId, chunk_number: usize) -> Result<()> {
        let chunk_size = self.manager(array_id)?.chunk_size();
        self.allocate_data(chunk_size)?;
        let manager = self.manager_mut(array_id)?;
        if let Err(e) = manager.reallocate_chunk_data(chunk_number) {
            self.free_data(chunk_size);
            return Err(e);
        }
        if let Err(e) = manager.read_chunk(chunk_number) {
            let _ = manager.delete_chunk_data(chunk_number);
            self.free_data(chunk_size);
            return Err(e);
        }
        self.mark_chunk_resident(array_id, chunk_number);
        Ok(())
    }

    fn page_in(&mut self, id: &BlockId) -> Result<()> {
        let chunk_number = self.existing(id)?.chunk_number();
        let resident = self
            .manager(id.array_id())?
            .chunk(chunk_number)
            .is_some_and(Chunk::in_memory);
        if resident {
            return Ok(());
        }
        self.read_chunk_from_disk(id.array_id(), chunk_number)
    }

    fn view(&mut self, id: &BlockId) -> Result<ServerBlockMut<'_>> {
        let Self {
            managers,
            block_map,
            ..
        } = self;
        let block = block_map
            .block_mut(id)
            .ok_or_else(|| SipError::BlockNotFound(id.to_string()))?;
        let manager = managers
            .get_mut(id.array_id().index())
            .and_then(Option::as_mut)
            .ok_or_else(|| no_manager(id.array_id()))?;
        let (data, valid_on_disk) =
            manager.block_data_mut(block.chunk_number(), block.offset(), block.size())?;
        Ok(ServerBlockMut::new(block, data, valid_on_disk))
    }

    // ── Block access ────────────────────────────────────────────────────────

    /// Create `id` in its array's tail chunk.
    pub fn create_block(&mut self, id: &BlockId, initialize: bool) -> Result<ServerBlockMut<'_>> {
        if self.block_map.contains(id) {
            return Err(SipError::DuplicateBlock(id.to_string()));
        }
        let array_id = id.array_id();
        let size = self.catalog.block_shape(id)?.num_elems();
        let needed = self.manager(array_id)?.doubles_needed_to_assign(size)?;
        self.allocate_data(needed)?;
        let assignment = match self
            .manager_mut(array_id)?
            .assign_block_data_from_chunk(size, initialize)
        {
            Ok(assignment) => assignment,
            Err(e) => {
                self.free_data(needed);
                return Err(e);
            }
        };
        if assignment.newly_allocated != needed {
            self.free_data(needed);
            self.allocated_doubles += assignment.newly_allocated;
        }
        if assignment.newly_allocated > 0 {
            self.mark_chunk_resident(array_id, assignment.chunk_number);
        }
        self.manager_mut(array_id)?
            .chunk_mut(assignment.chunk_number)
            .ok_or_else(|| no_manager(array_id))?
            .add_server_block(id.clone());

        let mut block = ServerBlock::new(size, assignment.chunk_number, assignment.offset);
        block.disk_state = DiskBackingState {
            in_memory: true,
            on_disk: false,
            dirty: true,
        };
        self.block_map.insert_block(id.clone(), block)?;
        self.policy.touch(id);
        trace!(
            block = %id,
            chunk = assignment.chunk_number,
            offset = assignment.offset,
            "created server block"
        );
        self.view(id)
    }

    fn prepare_for_update(&mut self, id: &BlockId, initialize: bool) -> Result<()> {
        if self.block_map.contains(id) {
            self.page_in(id)?;
        } else {
            let _ = self.create_block(id, initialize)?;
        }
        let chunk_number = self.existing(id)?.chunk_number();
        self.manager_mut(id.array_id())?
            .set_valid_on_disk(chunk_number, false)?;
        self.policy.touch(id);
        Ok(())
    }

    /// Block about to be overwritten by a PUT. Created if absent; pending
    /// transfers are completed first.
    pub fn get_block_for_writing(&mut self, id: &BlockId) -> Result<ServerBlockMut<'_>> {
        self.prepare_for_update(id, false)?;
        let mut view = self.view(id)?;
        view.wait_all()?;
        view.block_mut().disk_state.dirty = true;
        Ok(view)
    }

    /// Block about to be accumulated into. Created zeroed if absent. Pending
    /// accumulates stay in flight since they commute.
    pub fn get_block_for_accumulate(&mut self, id: &BlockId) -> Result<ServerBlockMut<'_>> {
        self.prepare_for_update(id, true)?;
        let mut view = self.view(id)?;
        view.block_mut().disk_state.dirty = true;
        Ok(view)
    }

    /// Block about to be sent in reply to a GET. Fails if the block was never
    /// written; pending writes are completed first.
    pub fn get_block_for_reading(&mut self, id: &BlockId) -> Result<ServerBlockMut<'_>> {
        self.page_in(id)?;
        self.policy.touch(id);
        let mut view = self.view(id)?;
        view.wait_for_writes()?;
        Ok(view)
    }

    /// Register a restored block whose data stays on disk at `file_offset`
    /// until first access.
    pub fn get_block_for_lazy_restore(
        &mut self,
        id: &BlockId,
        file_offset: usize,
    ) -> Result<&mut ServerBlock> {
        if self.block_map.contains(id) {
            return Err(SipError::DuplicateBlock(id.to_string()));
        }
        let array_id = id.array_id();
        let size = self.catalog.block_shape(id)?.num_elems();
        let manager = self.manager_mut(array_id)?;
        let assignment = manager.lazy_assign_block_data_from_chunk(file_offset, size)?;
        let chunk = manager
            .chunk_mut(assignment.chunk_number)
            .ok_or_else(|| no_manager(array_id))?;
        chunk.add_server_block(id.clone());
        let in_memory = chunk.in_memory();

        let mut block = ServerBlock::new(size, assignment.chunk_number, assignment.offset);
        block.disk_state = DiskBackingState {
            in_memory,
            on_disk: true,
            dirty: false,
        };
        self.block_map.insert_block(id.clone(), block)?;
        self.block_map
            .block_mut(id)
            .ok_or_else(|| SipError::BlockNotFound(id.to_string()))
    }

    /// Remove a block. Its chunk space is not reused.
    pub fn delete_block(&mut self, id: &BlockId) -> Result<()> {
        let block = self.existing(id)?;
        let chunk_number = block.chunk_number();
        if block.async_state.has_pending() {
            self.view(id)?.wait_all()?;
        }
        let _ = self.block_map.get_and_remove_block(id)?;
        self.manager_mut(id.array_id())?
            .chunk_mut(chunk_number)
            .ok_or_else(|| SipError::InvalidState(format!("{id} has no chunk")))?
            .remove_server_block(id)
    }

    /// Update the consistency state of `id` for an access by `worker`.
    /// Returns false when the access races with another worker's.
    pub fn check_consistency(
        &mut self,
        id: &BlockId,
        message: MessageType,
        worker: WorkerId,
        section: SectionNumber,
    ) -> Result<bool> {
        let block = self
            .block_map
            .block_mut(id)
            .ok_or_else(|| SipError::BlockNotFound(id.to_string()))?;
        Ok(block.update_and_check_consistency(message, worker, section))
    }

    pub fn reset_consistency_status(&mut self) {
        let arrays: Vec<ArrayId> = self.block_map.populated_arrays().collect();
        for array_id in arrays {
            for block in self.block_map.per_array_map(array_id).values_mut() {
                block.reset_consistency_status();
            }
        }
    }

    // ── Per-array maps ──────────────────────────────────────────────────────

    pub fn per_array_map(&mut self, array_id: ArrayId) -> &mut PerArrayMap<ServerBlock> {
        self.block_map.per_array_map(array_id)
    }

    /// Detach an array together with its chunks. The array is left without
    /// backing storage until a [`ServedArray`] is inserted again.
    pub fn get_and_remove_per_array_map(&mut self, array_id: ArrayId) -> Result<ServedArray> {
        let chunks = self
            .managers
            .get_mut(array_id.index())
            .and_then(Option::take)
            .ok_or_else(|| no_manager(array_id))?;
        self.free_data(chunks.resident_doubles());
        self.policy.remove_all_blocks_for_array(array_id);
        Ok(ServedArray {
            blocks: self.block_map.get_and_remove_per_array_map(array_id),
            chunks,
        })
    }

    /// Attach `served` as `array_id`, dropping whatever the array held.
    pub fn insert_per_array_map(&mut self, array_id: ArrayId, served: ServedArray) -> Result<()> {
        if array_id.index() >= self.managers.len() {
            return Err(no_manager(array_id));
        }
        if self.chunk_manager(array_id).is_some() {
            let _ = self.delete_per_array_map_and_blocks(array_id)?;
        }
        let ServedArray { blocks, mut chunks } = served;
        chunks.set_array_id(array_id);
        self.allocated_doubles += chunks.resident_doubles();
        self.block_map.insert_per_array_map(array_id, blocks);
        self.managers[array_id.index()] = Some(chunks);
        self.policy.touch_array(array_id);
        Ok(())
    }

    /// Drop every block of an array and its chunk data. Returns the doubles
    /// freed.
    pub fn delete_per_array_map_and_blocks(&mut self, array_id: ArrayId) -> Result<usize> {
        let Self {
            managers,
            block_map,
            policy,
            ..
        } = self;
        let mut freed = 0;
        if let Some(manager) = managers.get_mut(array_id.index()).and_then(Option::as_mut) {
            let blocks = block_map.per_array_map(array_id);
            for n in 0..manager.num_chunks() {
                if manager.chunk(n).is_some_and(Chunk::in_memory) {
                    manager.wait_all(n, blocks)?;
                }
            }
            freed = manager.clear();
        }
        block_map.delete_per_array_map(array_id);
        policy.remove_all_blocks_for_array(array_id);
        self.free_data(freed);
        Ok(freed)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Collectively write `array_id` and its index to disk and keep the file
    /// under `label`. The array is left empty with a fresh backing file.
    pub fn save_persistent_array(&mut self, array_id: ArrayId, label: &str) -> Result<()> {
        let catalog = Arc::clone(&self.catalog);
        let num_blocks = catalog.num_blocks(array_id)?;
        let Self {
            managers,
            block_map,
            ..
        } = self;
        let manager = managers
            .get_mut(array_id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| no_manager(array_id))?;
        let blocks = block_map.per_array_map(array_id);
        for n in 0..manager.num_chunks() {
            if manager.chunk(n).is_some_and(Chunk::in_memory) {
                manager.wait_all(n, blocks)?;
            }
        }
        manager.collective_flush()?;

        let mut index = vec![ABSENT_OFFSET; num_blocks];
        for (id, block) in blocks.iter() {
            let block_number = catalog.block_number(id)?;
            let offset = manager.block_file_offset(block.chunk_number(), block.offset())?;
            index[block_number] = i64::try_from(offset)
                .map_err(|_| SipError::Format(format!("offset {offset} exceeds i64")))?;
        }
        manager.file().write_index(&mut index)?;

        let fresh = self.new_manager(array_id)?;
        let Some(mut old) = self.managers[array_id.index()].replace(fresh) else {
            return Err(no_manager(array_id));
        };
        let freed = old.delete_chunk_data_all();
        self.free_data(freed);
        self.block_map.delete_per_array_map(array_id);
        self.policy.remove_all_blocks_for_array(array_id);

        let mut file = old.into_file();
        file.mark_persistent(label);
        if self.saved.insert(label.to_owned(), file).is_some() {
            warn!(label, "persistent label reused, previous array dropped");
        }
        debug!(
            array = array_id.0,
            label,
            blocks = num_blocks,
            freed,
            "saved persistent array"
        );
        Ok(())
    }

    /// Collectively make the array saved under `label` the contents of
    /// `array_id`. The label is consumed.
    pub fn restore_persistent_array(&mut self, array_id: ArrayId, label: &str) -> Result<()> {
        let file = self.saved.remove(label).ok_or_else(|| {
            SipError::InvalidState(format!("no persistent array labelled {label}"))
        })?;
        let num_blocks = self.catalog.num_blocks(array_id)?;
        let index = file.read_index(num_blocks)?;
        let _ = self.delete_per_array_map_and_blocks(array_id)?;
        let slot = self
            .managers
            .get_mut(array_id.index())
            .ok_or_else(|| no_manager(array_id))?;
        *slot = Some(ChunkManager::new(file));
        let restored = if self.options.lazy_restore {
            self.lazy_restore_chunks_from_index(array_id, &index)?
        } else {
            self.eager_restore_chunks_from_index(array_id, &index)?
        };
        debug!(
            array = array_id.0,
            label,
            restored,
            lazy = self.options.lazy_restore,
            "restored persistent array"
        );
        Ok(())
    }

    /// Register every block of this server listed in `index` without reading
    /// data. Returns the number of blocks registered.
    pub fn lazy_restore_chunks_from_index(
        &mut self,
        array_id: ArrayId,
        index: &[i64],
    ) -> Result<usize> {
        let mut restored = 0;
        for (block_number, &offset) in index.iter().enumerate() {
            let Ok(file_offset) = usize::try_from(offset) else {
                continue;
            };
            if !self.manager(array_id)?.owns_file_offset(file_offset) {
                continue;
            }
            let id = self.catalog.block_id(array_id, block_number)?;
            self.get_block_for_lazy_restore(&id, file_offset)?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Register the blocks in `index` and collectively read their chunks.
    /// Returns the number of blocks restored.
    pub fn eager_restore_chunks_from_index(
        &mut self,
        array_id: ArrayId,
        index: &[i64],
    ) -> Result<usize> {
        let restored = self.lazy_restore_chunks_from_index(array_id, index)?;
        let needed = self.manager(array_id)?.doubles_needed_for_restore();
        self.allocate_data(needed)?;
        let read = self.manager_mut(array_id)?.collective_restore()?;
        if read != needed {
            self.free_data(needed);
            self.allocated_doubles += read;
        }
        for block in self.block_map.per_array_map(array_id).values_mut() {
            block.disk_state.in_memory = true;
        }
        self.policy.touch_array(array_id);
        Ok(restored)
    }
}

fn no_manager(array_id: ArrayId) -> SipError {
    SipError::InvalidState(format!("array {array_id} has no backing chunks"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::UniformArrayCatalog;
    use crate::collective::{LocalCollective, SingleProcess};
    use parking_lot::Mutex;
    use sip_block::transfer_channel;

    /// Two arrays of eight 2-element blocks, 4-double chunks, room for two
    /// chunks in memory.
    fn small_map(lazy_restore: bool) -> (DiskBackedBlockMap, Arc<UniformArrayCatalog>) {
        let mut catalog = UniformArrayCatalog::new();
        catalog.add_array(&[8], &[2]).expect("array 0");
        catalog.add_array(&[8], &[2]).expect("array 1");
        let catalog = Arc::new(catalog);
        let options = ServerOptions {
            max_allocatable_bytes: 8 * DOUBLE_BYTES,
            chunk_size: 4,
            scratch_dir: None,
            lazy_restore,
        };
        let map = DiskBackedBlockMap::new(
            options,
            Arc::clone(&catalog) as Arc<dyn ArrayCatalog>,
            Arc::new(SingleProcess),
        )
        .expect("map");
        (map, catalog)
    }

    fn id(catalog: &UniformArrayCatalog, array: u32, n: usize) -> BlockId {
        catalog.block_id(ArrayId(array), n).expect("id")
    }

    #[allow(clippy::cast_precision_loss)]
    fn fill_blocks(
        map: &mut DiskBackedBlockMap,
        catalog: &UniformArrayCatalog,
        array: u32,
        count: usize,
    ) {
        for n in 0..count {
            let mut block = map
                .get_block_for_writing(&id(catalog, array, n))
                .expect("write");
            block.fill_data(n as f64 + f64::from(array) * 100.0);
        }
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn spills_chunks_and_reads_them_back() {
        let (mut map, catalog) = small_map(false);
        fill_blocks(&mut map, &catalog, 0, 8);
        assert_eq!(map.total_blocks(), 8);
        assert_eq!(map.allocated_doubles(), 8);
        let manager = map.chunk_manager(ArrayId(0)).expect("manager");
        assert_eq!(manager.num_chunks(), 4);
        assert_eq!(manager.resident_doubles(), 8);

        for n in 0..8 {
            let block = map
                .get_block_for_reading(&id(&catalog, 0, n))
                .expect("read");
            assert_eq!(block.data(), &[n as f64; 2]);
            assert!(block.block().disk_state.in_memory);
            assert!(map.allocated_doubles() <= map.max_allocatable_doubles());
        }
    }

    #[test]
    fn rewritten_chunk_is_backed_up_again() {
        let (mut map, catalog) = small_map(false);
        fill_blocks(&mut map, &catalog, 0, 8);
        // Block 0's chunk was paged out; rewrite it, then force it out again.
        map.get_block_for_writing(&id(&catalog, 0, 0))
            .expect("rewrite")
            .fill_data(-1.0);
        fill_blocks(&mut map, &catalog, 1, 8);
        let block = map
            .get_block_for_reading(&id(&catalog, 0, 0))
            .expect("read");
        assert_eq!(block.data(), &[-1.0, -1.0]);
    }

    #[test]
    fn reading_missing_block_fails() {
        let (mut map, catalog) = small_map(false);
        let err = map
            .get_block_for_reading(&id(&catalog, 0, 3))
            .expect_err("never written");
        assert!(matches!(err, SipError::BlockNotFound(_)));
    }

    #[test]
    fn accumulate_creates_zeroed_block_and_delete_removes_it() {
        let (mut map, catalog) = small_map(false);
        let block_id = id(&catalog, 0, 5);
        for _ in 0..3 {
            map.get_block_for_accumulate(&block_id)
                .expect("accumulate")
                .accumulate_data(&[1.0, 2.0])
                .expect("add");
        }
        assert_eq!(
            map.get_block_for_reading(&block_id).expect("read").data(),
            &[3.0, 6.0]
        );
        map.delete_block(&block_id).expect("delete");
        assert!(!map.contains(&block_id));
        assert!(map.delete_block(&block_id).is_err());
        assert!(matches!(
            map.create_block(&block_id, true).map(|b| b.data().to_vec()),
            Ok(data) if data == vec![0.0, 0.0]
        ));
        assert!(matches!(
            map.create_block(&block_id, true).map(|_| ()),
            Err(SipError::DuplicateBlock(_))
        ));
    }

    #[test]
    fn pending_accumulate_lands_before_read() {
        let (mut map, catalog) = small_map(false);
        let block_id = id(&catalog, 0, 0);
        let staging = Arc::new(Mutex::new(vec![0.0; 2]));
        let (completer, transfer) = transfer_channel();
        {
            let mut block = map.get_block_for_accumulate(&block_id).expect("accumulate");
            block
                .block_mut()
                .async_state
                .add_put_accumulate_data_request(Box::new(transfer), Arc::clone(&staging));
        }
        staging.lock().copy_from_slice(&[4.0, 5.0]);
        completer.complete();
        let block = map.get_block_for_reading(&block_id).expect("read");
        assert_eq!(block.data(), &[4.0, 5.0]);
        assert!(!block.block().async_state.has_pending());
    }

    #[test]
    fn pending_put_lands_before_read() {
        let (mut map, catalog) = small_map(false);
        let block_id = id(&catalog, 0, 1);
        let staging = Arc::new(Mutex::new(vec![0.0; 2]));
        let (completer, transfer) = transfer_channel();
        {
            let mut block = map.get_block_for_writing(&block_id).expect("write");
            block.fill_data(1.0);
            block
                .block_mut()
                .async_state
                .add_put_data_request(Box::new(transfer), Arc::clone(&staging));
        }
        staging.lock().copy_from_slice(&[6.0, 7.0]);
        completer.complete();
        let block = map.get_block_for_reading(&block_id).expect("read");
        assert_eq!(block.data(), &[6.0, 7.0]);
        assert!(!block.block().async_state.has_pending());
    }

    #[test]
    fn change_through_read_view_survives_page_out() {
        let (mut map, catalog) = small_map(false);
        fill_blocks(&mut map, &catalog, 0, 8);
        let block_id = id(&catalog, 0, 0);
        let chunk_number = map.block(&block_id).expect("present").chunk_number();
        map.get_block_for_reading(&block_id)
            .expect("page in")
            .fill_data(-2.0);
        let chunk = map
            .chunk_manager(ArrayId(0))
            .and_then(|manager| manager.chunk(chunk_number))
            .expect("chunk");
        assert!(!chunk.valid_on_disk());

        fill_blocks(&mut map, &catalog, 1, 8);
        assert!(!map
            .chunk_manager(ArrayId(0))
            .and_then(|manager| manager.chunk(chunk_number))
            .is_some_and(Chunk::in_memory));
        let block = map.get_block_for_reading(&block_id).expect("read");
        assert_eq!(block.data(), &[-2.0, -2.0]);
    }

    #[test]
    fn put_landing_at_page_out_is_written_back() {
        let (mut map, catalog) = small_map(false);
        fill_blocks(&mut map, &catalog, 0, 8);
        let block_id = id(&catalog, 0, 0);
        let staging = Arc::new(Mutex::new(vec![9.0, 9.5]));
        let (completer, transfer) = transfer_channel();
        map.get_block_for_reading(&block_id)
            .expect("page in")
            .block_mut()
            .async_state
            .add_put_data_request(Box::new(transfer), staging);
        completer.complete();

        fill_blocks(&mut map, &catalog, 1, 8);
        let block = map.get_block_for_reading(&block_id).expect("read");
        assert_eq!(block.data(), &[9.0, 9.5]);
    }

    #[test]
    fn budget_is_enforced() {
        let (mut map, _catalog) = small_map(false);
        let err = map.allocate_data(9).expect_err("over budget");
        assert!(matches!(
            err,
            SipError::OutOfMemory {
                requested: 72,
                budget: 64,
                allocated: 0
            }
        ));
        assert!(map.set_max_allocatable_bytes(16).is_err());
        map.set_max_allocatable_bytes(32 * DOUBLE_BYTES).expect("raise");
        assert_eq!(map.remaining_doubles(), 32);
        assert!(map.set_max_allocatable_bytes(64 * DOUBLE_BYTES).is_err());
    }

    #[test]
    fn huge_reservation_is_out_of_memory() {
        let (mut map, _catalog) = small_map(false);
        let err = map.allocate_data(usize::MAX).expect_err("too large");
        assert!(matches!(
            err,
            SipError::OutOfMemory {
                requested: usize::MAX,
                budget: 64,
                allocated: 0
            }
        ));
        assert_eq!(map.remaining_doubles(), 8);
    }

    /// Eager restore reads every chunk at once, so it gets half the blocks.
    #[allow(clippy::cast_precision_loss)]
    fn save_and_restore(lazy: bool) {
        let (mut map, catalog) = small_map(lazy);
        let count = if lazy { 8 } else { 4 };
        fill_blocks(&mut map, &catalog, 0, count);
        map.delete_block(&id(&catalog, 0, 2)).expect("delete");
        map.save_persistent_array(ArrayId(0), "amplitudes")
            .expect("save");
        assert!(map.has_persistent_array("amplitudes"));
        assert!(map.per_array_map(ArrayId(0)).is_empty());
        assert_eq!(map.allocated_doubles(), 0);

        // Reuse the array before restoring over it.
        map.get_block_for_writing(&id(&catalog, 0, 1))
            .expect("scratch")
            .fill_data(42.0);
        map.restore_persistent_array(ArrayId(0), "amplitudes")
            .expect("restore");
        assert!(!map.has_persistent_array("amplitudes"));
        assert_eq!(map.per_array_map(ArrayId(0)).len(), count - 1);
        if lazy {
            assert_eq!(map.allocated_doubles(), 0);
        } else {
            assert_eq!(map.allocated_doubles(), 8);
        }
        assert!(!map.contains(&id(&catalog, 0, 2)));
        for n in (0..count).filter(|&n| n != 2) {
            let block = map
                .get_block_for_reading(&id(&catalog, 0, n))
                .expect("read restored");
            assert_eq!(block.data(), &[n as f64; 2]);
        }
    }

    #[test]
    fn eager_restore_round_trips_saved_array() {
        save_and_restore(false);
    }

    #[test]
    fn lazy_restore_round_trips_saved_array() {
        save_and_restore(true);
    }

    #[test]
    fn eager_restore_larger_than_budget_fails() {
        let (mut map, catalog) = small_map(false);
        fill_blocks(&mut map, &catalog, 0, 8);
        map.save_persistent_array(ArrayId(0), "big").expect("save");
        let err = map
            .restore_persistent_array(ArrayId(0), "big")
            .expect_err("four chunks do not fit in two");
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn restore_of_unknown_label_fails() {
        let (mut map, _catalog) = small_map(false);
        assert!(matches!(
            map.restore_persistent_array(ArrayId(0), "missing"),
            Err(SipError::InvalidState(_))
        ));
    }

    #[test]
    fn consistency_is_tracked_per_block() {
        let (mut map, catalog) = small_map(false);
        let block_id = id(&catalog, 1, 2);
        let section = SectionNumber(1);
        assert!(matches!(
            map.check_consistency(&block_id, MessageType::Get, WorkerId(0), section),
            Err(SipError::BlockNotFound(_))
        ));
        let _ = map.get_block_for_writing(&block_id).expect("write");
        assert!(map
            .check_consistency(&block_id, MessageType::Put, WorkerId(1), section)
            .expect("put"));
        assert!(!map
            .check_consistency(&block_id, MessageType::Get, WorkerId(2), section)
            .expect("racing get"));
        map.reset_consistency_status();
        assert!(map
            .check_consistency(&block_id, MessageType::Get, WorkerId(2), section)
            .expect("get after reset"));
    }

    #[test]
    fn detached_array_moves_with_its_chunks() {
        let (mut map, catalog) = small_map(false);
        map.get_block_for_writing(&id(&catalog, 0, 3))
            .expect("write")
            .fill_data(7.0);
        let served = map
            .get_and_remove_per_array_map(ArrayId(0))
            .expect("detach");
        assert_eq!(map.allocated_doubles(), 0);
        assert!(map.get_block_for_writing(&id(&catalog, 0, 3)).is_err());

        map.insert_per_array_map(ArrayId(1), served).expect("attach");
        assert_eq!(map.allocated_doubles(), 4);
        let moved = map
            .get_block_for_reading(&id(&catalog, 1, 3))
            .expect("read moved");
        assert_eq!(moved.data(), &[7.0, 7.0]);
    }

    #[test]
    fn options_parse_and_validate() {
        let options =
            ServerOptions::from_json(r#"{"chunk_size": 16, "lazy_restore": true}"#).expect("json");
        assert_eq!(options.chunk_size, 16);
        assert!(options.lazy_restore);
        assert_eq!(options.max_allocatable_bytes, DEFAULT_MAX_ALLOCATABLE_BYTES);
        assert!(ServerOptions::from_json(r#"{"chunk_size": 0}"#).is_err());
        assert!(
            ServerOptions::from_json(r#"{"chunk_size": 16, "max_allocatable_bytes": 64}"#)
                .is_err()
        );
    }

    #[test]
    fn multiple_servers_need_a_scratch_dir() {
        let member = LocalCollective::group(2).pop().expect("member");
        let err = DiskBackedBlockMap::new(
            ServerOptions::default(),
            Arc::new(UniformArrayCatalog::new()),
            Arc::new(member),
        )
        .expect_err("no scratch dir");
        assert!(matches!(err, SipError::Config(_)));
    }
}
