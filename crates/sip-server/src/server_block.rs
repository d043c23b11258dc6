//! Server-side block metadata.
//!
//! A [`ServerBlock`] does not own its data: the doubles live in a chunk of
//! the array's [`ChunkManager`](crate::ChunkManager) at `(chunk_number,
//! offset)`. [`ServerBlockMut`] pairs the metadata with that slice.

use crate::consistency::DistributedBlockConsistency;
use parking_lot::Mutex;
use sip_block::AsyncTransfer;
use sip_error::{Result, SipError};
use sip_types::{MessageType, SectionNumber, WorkerId};
use std::sync::Arc;

/// Residency of a block's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskBackingState {
    pub in_memory: bool,
    pub on_disk: bool,
    pub dirty: bool,
}

// ── Async operations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOpKind {
    /// Reply to a GET; reads the block data.
    GetReply,
    /// Receive of PUT data into a staging buffer, copied over the block on
    /// completion.
    PutData,
    /// Receive of PUT_ACCUMULATE data into a staging buffer, added to the
    /// block on completion.
    PutAccumulateData,
}

impl AsyncOpKind {
    fn writes_block(self) -> bool {
        matches!(self, Self::PutData | Self::PutAccumulateData)
    }
}

/// Buffer a transport fills for a put or accumulate request.
pub type StagingBuffer = Arc<Mutex<Vec<f64>>>;

#[derive(Debug)]
struct PendingOp {
    kind: AsyncOpKind,
    transfer: Box<dyn AsyncTransfer>,
    staging: Option<StagingBuffer>,
}

impl PendingOp {
    fn finish(self, data: &mut [f64]) -> Result<()> {
        let Some(staging) = self.staging else {
            return Ok(());
        };
        let staged = staging.lock();
        if staged.len() != data.len() {
            return Err(SipError::ShapeMismatch {
                expected: format!("{} staged elements", data.len()),
                actual: format!("{} elements", staged.len()),
            });
        }
        match self.kind {
            AsyncOpKind::PutData => data.copy_from_slice(&staged),
            AsyncOpKind::PutAccumulateData => {
                for (dst, add) in data.iter_mut().zip(staged.iter()) {
                    *dst += add;
                }
            }
            AsyncOpKind::GetReply => {}
        }
        Ok(())
    }
}

/// In-flight transfers touching one server block.
#[derive(Debug, Default)]
pub struct BlockAsyncManager {
    pending: Vec<PendingOp>,
}

impl BlockAsyncManager {
    pub fn add_get_reply(&mut self, transfer: Box<dyn AsyncTransfer>) {
        self.push(AsyncOpKind::GetReply, transfer, None);
    }

    pub fn add_put_data_request(
        &mut self,
        transfer: Box<dyn AsyncTransfer>,
        staging: StagingBuffer,
    ) {
        self.push(AsyncOpKind::PutData, transfer, Some(staging));
    }

    pub fn add_put_accumulate_data_request(
        &mut self,
        transfer: Box<dyn AsyncTransfer>,
        staging: StagingBuffer,
    ) {
        self.push(AsyncOpKind::PutAccumulateData, transfer, Some(staging));
    }

    fn push(
        &mut self,
        kind: AsyncOpKind,
        transfer: Box<dyn AsyncTransfer>,
        staging: Option<StagingBuffer>,
    ) {
        self.pending.push(PendingOp {
            kind,
            transfer,
            staging,
        });
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether a pending operation will change the block data.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.pending.iter().any(|op| op.kind.writes_block())
    }

    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Finish every completed operation without blocking. Returns true when
    /// nothing is left pending.
    pub fn try_handle_all(&mut self, data: &mut [f64]) -> Result<bool> {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        let mut result = Ok(());
        for mut op in self.pending.drain(..) {
            if op.transfer.test() {
                if let Err(e) = op.finish(data) {
                    result = Err(e);
                }
            } else {
                still_pending.push(op);
            }
        }
        self.pending = still_pending;
        result.map(|()| self.pending.is_empty())
    }

    /// Block until every operation completes.
    pub fn wait_all(&mut self, data: &mut [f64]) -> Result<()> {
        self.wait_where(data, |_| true)
    }

    /// Block until every operation that writes the block completes. Get
    /// replies may stay in flight.
    pub fn wait_for_writes(&mut self, data: &mut [f64]) -> Result<()> {
        self.wait_where(data, AsyncOpKind::writes_block)
    }

    fn wait_where(&mut self, data: &mut [f64], select: impl Fn(AsyncOpKind) -> bool) -> Result<()> {
        let (selected, kept): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|op| select(op.kind));
        self.pending = kept;
        let mut result = Ok(());
        for mut op in selected {
            op.transfer.wait();
            if let Err(e) = op.finish(data) {
                result = Err(e);
            }
        }
        result
    }
}

// ── ServerBlock ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ServerBlock {
    size: usize,
    chunk_number: usize,
    offset: usize,
    pub disk_state: DiskBackingState,
    pub async_state: BlockAsyncManager,
    consistency: DistributedBlockConsistency,
}

impl ServerBlock {
    /// Metadata for `size` doubles at `offset` within chunk `chunk_number`.
    #[must_use]
    pub fn new(size: usize, chunk_number: usize, offset: usize) -> Self {
        Self {
            size,
            chunk_number,
            offset,
            disk_state: DiskBackingState::default(),
            async_state: BlockAsyncManager::default(),
            consistency: DistributedBlockConsistency::new(),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn chunk_number(&self) -> usize {
        self.chunk_number
    }

    /// Offset in doubles within the chunk.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn consistency(&self) -> &DistributedBlockConsistency {
        &self.consistency
    }

    pub fn update_and_check_consistency(
        &mut self,
        message: MessageType,
        worker: WorkerId,
        section: SectionNumber,
    ) -> bool {
        self.consistency
            .update_and_check_consistency(message, worker, section)
    }

    pub fn reset_consistency_status(&mut self) {
        self.consistency.reset_consistency_status();
    }
}

/// A server block together with its data slice.
///
/// Every change to the data, including pending puts landing, clears the
/// owning chunk's on-disk copy so the chunk is written again on page-out.
#[derive(Debug)]
pub struct ServerBlockMut<'a> {
    block: &'a mut ServerBlock,
    data: &'a mut [f64],
    chunk_valid_on_disk: &'a mut bool,
}

impl<'a> ServerBlockMut<'a> {
    pub(crate) fn new(
        block: &'a mut ServerBlock,
        data: &'a mut [f64],
        chunk_valid_on_disk: &'a mut bool,
    ) -> Self {
        Self {
            block,
            data,
            chunk_valid_on_disk,
        }
    }

    fn mark_modified(&mut self) {
        self.block.disk_state.dirty = true;
        *self.chunk_valid_on_disk = false;
    }

    fn mark_modified_if_writes_pending(&mut self) {
        if self.block.async_state.has_pending_writes() {
            self.mark_modified();
        }
    }

    #[must_use]
    pub fn block(&self) -> &ServerBlock {
        self.block
    }

    pub fn block_mut(&mut self) -> &mut ServerBlock {
        self.block
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        self.mark_modified();
        self.data
    }

    pub fn fill_data(&mut self, value: f64) {
        self.data_mut().fill(value);
    }

    pub fn scale_data(&mut self, factor: f64) {
        for v in self.data_mut() {
            *v *= factor;
        }
    }

    pub fn increment_data(&mut self, delta: f64) {
        for v in self.data_mut() {
            *v += delta;
        }
    }

    /// Element-wise `data += source`.
    pub fn accumulate_data(&mut self, source: &[f64]) -> Result<()> {
        if source.len() != self.data.len() {
            return Err(SipError::ShapeMismatch {
                expected: format!("{} elements", self.data.len()),
                actual: format!("{} elements", source.len()),
            });
        }
        for (dst, add) in self.data_mut().iter_mut().zip(source) {
            *dst += add;
        }
        Ok(())
    }

    pub fn wait_all(&mut self) -> Result<()> {
        self.mark_modified_if_writes_pending();
        self.block.async_state.wait_all(self.data)
    }

    pub fn wait_for_writes(&mut self) -> Result<()> {
        self.mark_modified_if_writes_pending();
        self.block.async_state.wait_for_writes(self.data)
    }

    pub fn try_handle_all(&mut self) -> Result<bool> {
        self.mark_modified_if_writes_pending();
        self.block.async_state.try_handle_all(self.data)
    }
}
