//! Chunked storage of one served array.
//!
//! Server blocks are bump-allocated out of fixed-size chunks. Chunk `n` of
//! server `r` lives at file offset `(num_servers * n + r) * chunk_size`
//! doubles, so a chunk's place in the [`ArrayFile`] never has to be stored.
//!
//! # Invariants
//!
//! - `num_assigned_doubles <= chunk_size` for every chunk.
//! - A chunk without data (`data == None`) is either valid on disk or has
//!   never held a block.
//! - `collective_flush` and `collective_restore` are collective: every server
//!   issues the same number of I/O calls, padding with no-ops.

use crate::array_file::ArrayFile;
use crate::server_block::ServerBlock;
use sip_block::PerArrayMap;
use sip_error::{Result, SipError};
use sip_types::{ArrayId, BlockId};
use std::ops::Range;
use tracing::{debug, trace};

// ── Chunk ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Chunk {
    data: Option<Vec<f64>>,
    file_offset: usize,
    num_assigned_doubles: usize,
    valid_on_disk: bool,
    blocks: Vec<BlockId>,
}

impl Chunk {
    fn allocated(chunk_size: usize, file_offset: usize) -> Self {
        Self {
            data: Some(vec![0.0; chunk_size]),
            file_offset,
            num_assigned_doubles: 0,
            valid_on_disk: false,
            blocks: Vec::new(),
        }
    }

    fn on_disk(file_offset: usize) -> Self {
        Self {
            data: None,
            file_offset,
            num_assigned_doubles: 0,
            valid_on_disk: true,
            blocks: Vec::new(),
        }
    }

    #[must_use]
    pub fn data(&self) -> Option<&[f64]> {
        self.data.as_deref()
    }

    /// Offset in doubles of the chunk within the data file.
    #[must_use]
    pub fn file_offset(&self) -> usize {
        self.file_offset
    }

    #[must_use]
    pub fn num_assigned_doubles(&self) -> usize {
        self.num_assigned_doubles
    }

    #[must_use]
    pub fn valid_on_disk(&self) -> bool {
        self.valid_on_disk
    }

    #[must_use]
    pub fn in_memory(&self) -> bool {
        self.data.is_some()
    }

    /// Ids of the server blocks stored in this chunk.
    #[must_use]
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn add_server_block(&mut self, id: BlockId) {
        self.blocks.push(id);
    }

    pub fn remove_server_block(&mut self, id: &BlockId) -> Result<()> {
        let position = self
            .blocks
            .iter()
            .position(|b| b == id)
            .ok_or_else(|| SipError::BlockNotFound(format!("{id} not in chunk")))?;
        self.blocks.swap_remove(position);
        Ok(())
    }

    /// Complete every pending transfer of the blocks in this chunk. A put
    /// landing clears the on-disk copy.
    pub fn wait_all(&mut self, blocks: &mut PerArrayMap<ServerBlock>) -> Result<()> {
        let Self {
            data,
            blocks: ids,
            valid_on_disk,
            ..
        } = self;
        for id in ids.iter() {
            let Some(block) = blocks.get_mut(id) else {
                continue;
            };
            if !block.async_state.has_pending() {
                continue;
            }
            let data = data.as_deref_mut().ok_or_else(|| {
                SipError::InvalidState(format!("{id} has pending transfers but no data"))
            })?;
            let range = block.offset()..block.offset() + block.size();
            let slice = data.get_mut(range).ok_or_else(|| {
                SipError::InvalidState(format!("{id} lies outside its chunk"))
            })?;
            if block.async_state.has_pending_writes() {
                *valid_on_disk = false;
                block.disk_state.dirty = true;
            }
            block.async_state.wait_all(slice)?;
        }
        Ok(())
    }
}

/// Where a block landed in its array's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub chunk_number: usize,
    /// Offset in doubles within the chunk.
    pub offset: usize,
    /// Doubles allocated to satisfy the request: a chunk's worth when a new
    /// chunk was created or a paged-out one read back, zero otherwise.
    pub newly_allocated: usize,
}

// ── ChunkManager ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ChunkManager {
    file: ArrayFile,
    chunks: Vec<Chunk>,
    chunk_size: usize,
    rank: usize,
    num_servers: usize,
}

impl ChunkManager {
    #[must_use]
    pub fn new(file: ArrayFile) -> Self {
        let chunk_size = file.chunk_size();
        let num_servers = file.num_servers();
        let rank = file.collective().rank();
        Self {
            file,
            chunks: Vec::new(),
            chunk_size,
            rank,
            num_servers,
        }
    }

    #[must_use]
    pub fn file(&self) -> &ArrayFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut ArrayFile {
        &mut self.file
    }

    /// Give up the backing file. Chunk data still in memory is dropped.
    #[must_use]
    pub fn into_file(self) -> ArrayFile {
        self.file
    }

    /// Doubles per chunk.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Largest chunk count of any server in the group. Collective.
    pub fn max_num_chunks(&self) -> Result<usize> {
        let max = self
            .file
            .collective()
            .all_reduce_max(self.chunks.len() as u64)?;
        usize::try_from(max).map_err(|_| SipError::Collective(format!("chunk count {max}")))
    }

    #[must_use]
    pub fn chunk(&self, chunk_number: usize) -> Option<&Chunk> {
        self.chunks.get(chunk_number)
    }

    pub fn chunk_mut(&mut self, chunk_number: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(chunk_number)
    }

    fn existing(&self, chunk_number: usize) -> Result<&Chunk> {
        self.chunks
            .get(chunk_number)
            .ok_or_else(|| SipError::InvalidState(format!("no chunk {chunk_number}")))
    }

    fn existing_mut(&mut self, chunk_number: usize) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(chunk_number)
            .ok_or_else(|| SipError::InvalidState(format!("no chunk {chunk_number}")))
    }

    /// File offset in doubles of this server's chunk `chunk_number`.
    #[must_use]
    pub fn chunk_offset(&self, chunk_number: usize) -> usize {
        (self.num_servers * chunk_number + self.rank) * self.chunk_size
    }

    /// Whether `file_offset` falls in one of this server's chunk stripes.
    #[must_use]
    pub fn owns_file_offset(&self, file_offset: usize) -> bool {
        (file_offset / self.chunk_size) % self.num_servers == self.rank
    }

    /// Doubles currently held in memory by this manager's chunks.
    #[must_use]
    pub fn resident_doubles(&self) -> usize {
        self.chunks
            .iter()
            .filter_map(|chunk| chunk.data.as_ref())
            .map(Vec::len)
            .sum()
    }

    /// File offset in doubles of the block at `offset` in `chunk_number`.
    pub fn block_file_offset(&self, chunk_number: usize, offset: usize) -> Result<usize> {
        Ok(self.existing(chunk_number)?.file_offset + offset)
    }

    /// Append a zeroed chunk. Returns the doubles allocated.
    pub fn new_chunk(&mut self) -> usize {
        let chunk_number = self.chunks.len();
        let file_offset = self.chunk_offset(chunk_number);
        self.chunks.push(Chunk::allocated(self.chunk_size, file_offset));
        debug!(chunk_number, file_offset, "new chunk");
        self.chunk_size
    }

    /// Append a chunk whose data is on disk at `file_offset`.
    pub fn new_chunk_for_restore(&mut self, file_offset: usize) -> Result<()> {
        let expected = self.chunk_offset(self.chunks.len());
        if file_offset != expected {
            return Err(SipError::Format(format!(
                "restored chunk {} at offset {file_offset}, layout expects {expected}",
                self.chunks.len()
            )));
        }
        self.chunks.push(Chunk::on_disk(file_offset));
        Ok(())
    }

    /// Give a paged-out chunk a fresh buffer. Returns the doubles allocated.
    pub fn reallocate_chunk_data(&mut self, chunk_number: usize) -> Result<usize> {
        let chunk_size = self.chunk_size;
        let chunk = self.existing_mut(chunk_number)?;
        if chunk.data.is_some() {
            return Err(SipError::InvalidState(format!(
                "chunk {chunk_number} already holds data"
            )));
        }
        chunk.data = Some(vec![0.0; chunk_size]);
        Ok(chunk_size)
    }

    fn needs_new_chunk(&self, num_doubles: usize) -> bool {
        self.chunks
            .last()
            .is_none_or(|tail| tail.num_assigned_doubles + num_doubles > self.chunk_size)
    }

    /// Doubles that [`assign_block_data_from_chunk`](Self::assign_block_data_from_chunk)
    /// would allocate for a block of `num_doubles`.
    pub fn doubles_needed_to_assign(&self, num_doubles: usize) -> Result<usize> {
        if num_doubles > self.chunk_size {
            return Err(SipError::Config(format!(
                "block of {num_doubles} doubles exceeds chunk size {}",
                self.chunk_size
            )));
        }
        let tail_in_memory = self.chunks.last().is_some_and(Chunk::in_memory);
        if self.needs_new_chunk(num_doubles) || !tail_in_memory {
            Ok(self.chunk_size)
        } else {
            Ok(0)
        }
    }

    /// Carve `num_doubles` out of the tail chunk, starting a new chunk when
    /// the tail is full and reading the tail back when it was paged out.
    pub fn assign_block_data_from_chunk(
        &mut self,
        num_doubles: usize,
        initialize: bool,
    ) -> Result<ChunkAssignment> {
        self.doubles_needed_to_assign(num_doubles)?;
        let newly_allocated = if self.needs_new_chunk(num_doubles) {
            self.new_chunk()
        } else {
            let tail = self.chunks.len() - 1;
            if self.chunks[tail].in_memory() {
                0
            } else {
                let allocated = self.reallocate_chunk_data(tail)?;
                self.read_chunk(tail)?;
                allocated
            }
        };

        let chunk_number = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_number];
        let offset = chunk.num_assigned_doubles;
        chunk.num_assigned_doubles += num_doubles;
        chunk.valid_on_disk = false;
        if initialize {
            if let Some(data) = chunk.data.as_deref_mut() {
                data[offset..offset + num_doubles].fill(0.0);
            }
        }
        trace!(chunk_number, offset, num_doubles, "assigned block data");
        Ok(ChunkAssignment {
            chunk_number,
            offset,
            newly_allocated,
        })
    }

    /// Place a block restored from an index at its recorded file offset,
    /// creating on-disk chunks up to the one that holds it. No data is read.
    pub fn lazy_assign_block_data_from_chunk(
        &mut self,
        file_offset: usize,
        num_doubles: usize,
    ) -> Result<ChunkAssignment> {
        let stripe = file_offset / self.chunk_size;
        if !self.owns_file_offset(file_offset) {
            return Err(SipError::Format(format!(
                "offset {file_offset} belongs to server {}, not {}",
                stripe % self.num_servers,
                self.rank
            )));
        }
        let chunk_number = stripe / self.num_servers;
        while self.chunks.len() <= chunk_number {
            self.new_chunk_for_restore(self.chunk_offset(self.chunks.len()))?;
        }
        let offset = file_offset - self.chunk_offset(chunk_number);
        if offset + num_doubles > self.chunk_size {
            return Err(SipError::Format(format!(
                "block of {num_doubles} doubles at offset {file_offset} crosses a chunk boundary"
            )));
        }
        let chunk = &mut self.chunks[chunk_number];
        chunk.num_assigned_doubles = chunk.num_assigned_doubles.max(offset + num_doubles);
        Ok(ChunkAssignment {
            chunk_number,
            offset,
            newly_allocated: 0,
        })
    }

    /// Drop the data of one chunk. Returns the doubles freed.
    pub fn delete_chunk_data(&mut self, chunk_number: usize) -> Result<usize> {
        let chunk = self.existing_mut(chunk_number)?;
        let freed = chunk.data.take().map_or(0, |data| data.len());
        if freed > 0 {
            debug!(chunk_number, "chunk paged out");
        }
        Ok(freed)
    }

    /// Drop the data of every chunk. Returns the doubles freed.
    pub fn delete_chunk_data_all(&mut self) -> usize {
        self.chunks
            .iter_mut()
            .filter_map(|chunk| chunk.data.take())
            .map(|data| data.len())
            .sum()
    }

    /// Forget every chunk. Returns the doubles freed.
    pub fn clear(&mut self) -> usize {
        let freed = self.delete_chunk_data_all();
        self.chunks.clear();
        freed
    }

    fn data_range(&self, chunk_number: usize, offset: usize, size: usize) -> Result<Range<usize>> {
        let chunk = self.existing(chunk_number)?;
        if offset + size > chunk.num_assigned_doubles {
            return Err(SipError::InvalidState(format!(
                "range {offset}+{size} outside assigned part of chunk {chunk_number}"
            )));
        }
        Ok(offset..offset + size)
    }

    pub fn get_data(&self, chunk_number: usize, offset: usize, size: usize) -> Result<&[f64]> {
        let range = self.data_range(chunk_number, offset, size)?;
        self.chunks[chunk_number]
            .data
            .as_deref()
            .map(|data| &data[range])
            .ok_or_else(|| SipError::InvalidState(format!("chunk {chunk_number} is paged out")))
    }

    pub fn get_data_mut(
        &mut self,
        chunk_number: usize,
        offset: usize,
        size: usize,
    ) -> Result<&mut [f64]> {
        let range = self.data_range(chunk_number, offset, size)?;
        self.chunks[chunk_number]
            .data
            .as_deref_mut()
            .map(|data| &mut data[range])
            .ok_or_else(|| SipError::InvalidState(format!("chunk {chunk_number} is paged out")))
    }

    /// Block data together with the chunk's on-disk validity flag, for views
    /// that clear the flag when they write.
    pub(crate) fn block_data_mut(
        &mut self,
        chunk_number: usize,
        offset: usize,
        size: usize,
    ) -> Result<(&mut [f64], &mut bool)> {
        let range = self.data_range(chunk_number, offset, size)?;
        let chunk = &mut self.chunks[chunk_number];
        let data = chunk
            .data
            .as_deref_mut()
            .ok_or_else(|| SipError::InvalidState(format!("chunk {chunk_number} is paged out")))?;
        Ok((&mut data[range], &mut chunk.valid_on_disk))
    }

    pub fn set_valid_on_disk(&mut self, chunk_number: usize, valid: bool) -> Result<()> {
        self.existing_mut(chunk_number)?.valid_on_disk = valid;
        Ok(())
    }

    /// Rewrite the array id of every block recorded in the chunks.
    pub fn set_array_id(&mut self, array_id: ArrayId) {
        for id in self.chunks.iter_mut().flat_map(|chunk| chunk.blocks.iter_mut()) {
            id.set_array_id(array_id);
        }
    }

    pub fn wait_all(
        &mut self,
        chunk_number: usize,
        blocks: &mut PerArrayMap<ServerBlock>,
    ) -> Result<()> {
        self.existing_mut(chunk_number)?.wait_all(blocks)
    }

    // ── I/O ─────────────────────────────────────────────────────────────────

    /// Write one chunk independently of the other servers.
    pub fn write_chunk(&mut self, chunk_number: usize) -> Result<()> {
        let chunk = self.existing(chunk_number)?;
        let data = chunk.data.as_deref().ok_or_else(|| {
            SipError::InvalidState(format!("write of paged-out chunk {chunk_number}"))
        })?;
        self.file.chunk_write(chunk.file_offset, data)?;
        self.chunks[chunk_number].valid_on_disk = true;
        Ok(())
    }

    /// Read one chunk back into its (already allocated) buffer.
    pub fn read_chunk(&mut self, chunk_number: usize) -> Result<()> {
        let Self { file, chunks, .. } = self;
        let chunk = chunks
            .get_mut(chunk_number)
            .ok_or_else(|| SipError::InvalidState(format!("no chunk {chunk_number}")))?;
        if !chunk.valid_on_disk {
            return Err(SipError::InvalidState(format!(
                "chunk {chunk_number} has no valid copy on disk"
            )));
        }
        let data = chunk.data.as_deref_mut().ok_or_else(|| {
            SipError::InvalidState(format!("read into unallocated chunk {chunk_number}"))
        })?;
        file.chunk_read(chunk.file_offset, data)?;
        debug!(chunk_number, "chunk paged in");
        Ok(())
    }

    /// Collectively write every in-memory chunk not yet valid on disk.
    /// Returns the number of chunks this server wrote.
    pub fn collective_flush(&mut self) -> Result<usize> {
        let dirty: Vec<usize> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.in_memory() && !chunk.valid_on_disk)
            .map(|(n, _)| n)
            .collect();
        let rounds = self.collective_rounds(dirty.len())?;
        for &n in &dirty {
            let chunk = &self.chunks[n];
            if let Some(data) = chunk.data.as_deref() {
                self.file.chunk_write_all(chunk.file_offset, data)?;
            }
            self.chunks[n].valid_on_disk = true;
        }
        for _ in dirty.len()..rounds {
            self.file.chunk_write_all_nop()?;
        }
        debug!(written = dirty.len(), rounds, "collective flush");
        Ok(dirty.len())
    }

    fn restorable(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| {
                chunk.valid_on_disk && !chunk.in_memory() && !chunk.blocks.is_empty()
            })
            .map(|(n, _)| n)
    }

    /// Doubles [`collective_restore`](Self::collective_restore) would allocate.
    #[must_use]
    pub fn doubles_needed_for_restore(&self) -> usize {
        self.restorable().count() * self.chunk_size
    }

    /// Collectively read every paged-out chunk that holds blocks. Returns the
    /// doubles allocated.
    pub fn collective_restore(&mut self) -> Result<usize> {
        let pending: Vec<usize> = self.restorable().collect();
        let rounds = self.collective_rounds(pending.len())?;
        for &n in &pending {
            let mut data = vec![0.0; self.chunk_size];
            self.file
                .chunk_read_all(self.chunks[n].file_offset, &mut data)?;
            self.chunks[n].data = Some(data);
        }
        for _ in pending.len()..rounds {
            self.file.chunk_read_all_nop()?;
        }
        debug!(read = pending.len(), rounds, "collective restore");
        Ok(pending.len() * self.chunk_size)
    }

    fn collective_rounds(&self, mine: usize) -> Result<usize> {
        let max = self.file.collective().all_reduce_max(mine as u64)?;
        usize::try_from(max).map_err(|_| SipError::Collective(format!("round count {max}")))
    }
}
