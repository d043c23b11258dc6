use crate::kernels::{Permutation, SliceOffsets, TensorKernels};
use crate::memory::MemoryTracker;
use crate::transfer::AsyncTransfer;
use sip_error::{Result, SipError};
use sip_types::BlockShape;
use std::sync::Arc;
use tracing::warn;

const DOUBLE_BYTES: usize = std::mem::size_of::<f64>();

/// Residency flags. Device flags exist for accelerator offload and are
/// carried but never set by this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatus {
    pub on_host: bool,
    pub on_device: bool,
    pub dirty_on_host: bool,
    pub dirty_on_device: bool,
}

/// Reports the bytes of block data an entry of a block map holds.
pub trait BlockFootprint {
    fn data_bytes(&self) -> usize;
}

/// Dense buffer of doubles for one block of an array.
///
/// Invariant: when present, `data.len() == shape.num_elems()`.
#[derive(Debug)]
pub struct Block {
    shape: BlockShape,
    data: Option<Vec<f64>>,
    status: BlockStatus,
    pending: Option<Box<dyn AsyncTransfer>>,
    tracker: Option<Arc<MemoryTracker>>,
}

impl Block {
    /// Zero-initialized block.
    #[must_use]
    pub fn new(shape: BlockShape) -> Self {
        Self::from_buffer(shape, vec![0.0; shape.num_elems()], None)
    }

    /// Block wrapping `data`, which must hold exactly `shape.num_elems()` values.
    pub fn with_data(shape: BlockShape, data: Vec<f64>) -> Result<Self> {
        if data.len() != shape.num_elems() {
            return Err(SipError::ShapeMismatch {
                expected: format!("{} elements for {shape}", shape.num_elems()),
                actual: format!("{} elements", data.len()),
            });
        }
        Ok(Self::from_buffer(shape, data, None))
    }

    /// Block without host data.
    #[must_use]
    pub fn unallocated(shape: BlockShape) -> Self {
        Self {
            shape,
            data: None,
            status: BlockStatus::default(),
            pending: None,
            tracker: None,
        }
    }

    /// Block whose buffer has already been counted by `tracker`.
    pub(crate) fn tracked(shape: BlockShape, data: Vec<f64>, tracker: Arc<MemoryTracker>) -> Self {
        Self::from_buffer(shape, data, Some(tracker))
    }

    fn from_buffer(shape: BlockShape, data: Vec<f64>, tracker: Option<Arc<MemoryTracker>>) -> Self {
        Self {
            shape,
            data: Some(data),
            status: BlockStatus {
                on_host: true,
                ..BlockStatus::default()
            },
            pending: None,
            tracker,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    /// Number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.num_elems()
    }

    #[must_use]
    pub fn status(&self) -> BlockStatus {
        self.status
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Result<&[f64]> {
        self.data
            .as_deref()
            .ok_or_else(|| SipError::InvalidState(format!("block {} has no host data", self.shape)))
    }

    pub fn data_mut(&mut self) -> Result<&mut [f64]> {
        let shape = self.shape;
        self.status.dirty_on_host = true;
        self.data
            .as_deref_mut()
            .ok_or_else(|| SipError::InvalidState(format!("block {shape} has no host data")))
    }

    pub fn fill(&mut self, value: f64) -> Result<()> {
        self.data_mut()?.fill(value);
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for v in self.data_mut()? {
            *v *= factor;
        }
        Ok(())
    }

    pub fn increment_elements(&mut self, delta: f64) -> Result<()> {
        for v in self.data_mut()? {
            *v += delta;
        }
        Ok(())
    }

    /// Element-wise `self += source`. Shapes must match.
    pub fn accumulate_data(&mut self, source: &Block) -> Result<()> {
        if self.shape != source.shape {
            return Err(SipError::ShapeMismatch {
                expected: self.shape.to_string(),
                actual: source.shape.to_string(),
            });
        }
        let src = source.data()?;
        for (dst, add) in self.data_mut()?.iter_mut().zip(src) {
            *dst += add;
        }
        Ok(())
    }

    /// Copy `min(self.size(), source.size() - offset)` elements starting at
    /// `offset` in `source`. Used when a copy drops a simple index.
    pub fn copy_data_from(&mut self, source: &Block, offset: usize) -> Result<()> {
        let src = source.data()?;
        if offset > src.len() {
            return Err(SipError::InvalidState(format!(
                "copy offset {offset} beyond source of {} elements",
                src.len()
            )));
        }
        let dst = self.data_mut()?;
        let n = dst.len().min(src.len() - offset);
        dst[..n].copy_from_slice(&src[offset..offset + n]);
        Ok(())
    }

    /// `self = factor * source` over `self.size()` elements.
    pub fn scale_and_copy(&mut self, source: &Block, factor: f64) -> Result<()> {
        let src = source.data()?;
        let dst = self.data_mut()?;
        if src.len() < dst.len() {
            return Err(SipError::ShapeMismatch {
                expected: format!("at least {} source elements", dst.len()),
                actual: format!("{} elements", src.len()),
            });
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d = factor * s;
        }
        Ok(())
    }

    /// Fill `self` with `source` permuted so that old axis `i` becomes axis
    /// `permutation[i]`.
    pub fn transpose_copy(
        &mut self,
        source: &Block,
        rank: usize,
        permutation: &Permutation,
        kernels: &dyn TensorKernels,
    ) -> Result<()> {
        let dst_shape = self.shape;
        let src = source.data()?;
        kernels.permute_copy(
            rank,
            src,
            &source.shape,
            self.data_mut()?,
            &dst_shape,
            permutation,
        )
    }

    /// Copy the window of `self` starting at `offsets` into `destination`.
    pub fn extract_slice(
        &self,
        rank: usize,
        offsets: &SliceOffsets,
        destination: &mut Block,
        kernels: &dyn TensorKernels,
    ) -> Result<()> {
        let dst_shape = destination.shape;
        kernels.slice_extract(
            rank,
            self.data()?,
            &self.shape,
            destination.data_mut()?,
            &dst_shape,
            offsets,
        )
    }

    /// Write `source` into the window of `self` starting at `offsets`.
    pub fn insert_slice(
        &mut self,
        rank: usize,
        offsets: &SliceOffsets,
        source: &Block,
        kernels: &dyn TensorKernels,
    ) -> Result<()> {
        let dst_shape = self.shape;
        kernels.slice_insert(
            rank,
            self.data_mut()?,
            &dst_shape,
            source.data()?,
            &source.shape,
            offsets,
        )
    }

    /// Release host data and clear the host flags.
    pub fn free_host_data(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(tracker) = &self.tracker {
                tracker.dec_allocated(data.len());
            }
        }
        self.status.on_host = false;
        self.status.dirty_on_host = false;
    }

    /// Allocate zeroed host data.
    pub fn allocate_host_data(&mut self) {
        if self.data.is_some() {
            warn!(shape = %self.shape, "allocating host data over an existing buffer");
            self.free_host_data();
        }
        let n = self.size();
        if let Some(tracker) = &self.tracker {
            tracker.inc_allocated(n);
        }
        self.data = Some(vec![0.0; n]);
        self.status.on_host = true;
        self.status.dirty_on_host = false;
    }

    /// Attach an in-flight transfer touching this block's buffer.
    ///
    /// A transfer already attached is waited on first.
    pub fn set_pending(&mut self, transfer: Box<dyn AsyncTransfer>) {
        self.wait();
        self.pending = Some(transfer);
    }

    /// Whether a transfer is attached; does not poll it.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Poll the attached transfer. True when nothing is outstanding.
    pub fn test(&mut self) -> bool {
        let done = self.pending.as_mut().is_none_or(|t| t.test());
        if done {
            self.pending = None;
        }
        done
    }

    /// Block until the attached transfer, if any, completes.
    pub fn wait(&mut self) {
        if let Some(mut transfer) = self.pending.take() {
            transfer.wait();
        }
    }
}

impl BlockFootprint for Block {
    fn data_bytes(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len().saturating_mul(DOUBLE_BYTES))
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if !self.test() {
            warn!(
                shape = %self.shape,
                "dropping block with a pending transfer, probably a get whose block was never used"
            );
            self.wait();
        }
        self.free_host_data();
    }
}
