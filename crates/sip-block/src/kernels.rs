//! Tensor kernel seam used by [`Block`](crate::Block) for permutations and slices.
//!
//! Production builds plug in an optimized implementation; [`ReferenceKernels`]
//! is a straightforward column-major version (first index fastest).

use sip_error::{Result, SipError};
use sip_types::{BlockShape, MAX_RANK};

/// Axis permutation: element `i` is the new position of old axis `i`.
pub type Permutation = [usize; MAX_RANK];

/// Per-dimension starting offsets of a slice within a larger block.
pub type SliceOffsets = [usize; MAX_RANK];

/// Opaque numeric routines over dense column-major blocks.
pub trait TensorKernels {
    /// Copy `src` into `dst`, moving old axis `i` to axis `permutation[i]`.
    fn permute_copy(
        &self,
        rank: usize,
        src: &[f64],
        src_shape: &BlockShape,
        dst: &mut [f64],
        dst_shape: &BlockShape,
        permutation: &Permutation,
    ) -> Result<()>;

    /// Copy the `dst_shape`-sized window of `src` starting at `offsets` into `dst`.
    fn slice_extract(
        &self,
        rank: usize,
        src: &[f64],
        src_shape: &BlockShape,
        dst: &mut [f64],
        dst_shape: &BlockShape,
        offsets: &SliceOffsets,
    ) -> Result<()>;

    /// Write `src` into the window of `dst` starting at `offsets`.
    fn slice_insert(
        &self,
        rank: usize,
        dst: &mut [f64],
        dst_shape: &BlockShape,
        src: &[f64],
        src_shape: &BlockShape,
        offsets: &SliceOffsets,
    ) -> Result<()>;
}

/// Portable loop-nest kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

fn strides(shape: &BlockShape) -> [usize; MAX_RANK] {
    let sizes = shape.segment_sizes();
    let mut strides = [1; MAX_RANK];
    for k in 1..MAX_RANK {
        strides[k] = strides[k - 1] * sizes[k - 1];
    }
    strides
}

fn check_rank(rank: usize) -> Result<()> {
    if rank > MAX_RANK {
        return Err(SipError::InvalidState(format!(
            "rank {rank} exceeds MAX_RANK {MAX_RANK}"
        )));
    }
    Ok(())
}

fn check_len(what: &str, buf_len: usize, shape: &BlockShape) -> Result<()> {
    if buf_len < shape.num_elems() {
        return Err(SipError::InvalidState(format!(
            "{what} buffer holds {buf_len} elements, shape {shape} needs {}",
            shape.num_elems()
        )));
    }
    Ok(())
}

/// Advance a column-major multi-index; returns false after the last element.
fn next_index(idx: &mut [usize; MAX_RANK], extents: &[usize; MAX_RANK]) -> bool {
    for k in 0..MAX_RANK {
        idx[k] += 1;
        if idx[k] < extents[k] {
            return true;
        }
        idx[k] = 0;
    }
    false
}

fn check_window(
    rank: usize,
    outer: &BlockShape,
    inner: &BlockShape,
    offsets: &SliceOffsets,
) -> Result<()> {
    let outer_sizes = outer.segment_sizes();
    let inner_sizes = inner.segment_sizes();
    for k in 0..MAX_RANK {
        let offset = if k < rank { offsets[k] } else { 0 };
        if offset + inner_sizes[k] > outer_sizes[k] {
            return Err(SipError::ShapeMismatch {
                expected: format!("slice within {outer}"),
                actual: format!("slice {inner} at offset {offset} in dimension {k}"),
            });
        }
    }
    Ok(())
}

fn window_offset(
    rank: usize,
    idx: &[usize; MAX_RANK],
    offsets: &SliceOffsets,
    outer_strides: &[usize; MAX_RANK],
) -> usize {
    (0..MAX_RANK)
        .map(|k| {
            let shift = if k < rank { offsets[k] } else { 0 };
            (idx[k] + shift) * outer_strides[k]
        })
        .sum()
}

impl TensorKernels for ReferenceKernels {
    fn permute_copy(
        &self,
        rank: usize,
        src: &[f64],
        src_shape: &BlockShape,
        dst: &mut [f64],
        dst_shape: &BlockShape,
        permutation: &Permutation,
    ) -> Result<()> {
        check_rank(rank)?;
        check_len("source", src.len(), src_shape)?;
        check_len("destination", dst.len(), dst_shape)?;

        let mut axis_map = [0_usize; MAX_RANK];
        let mut seen = [false; MAX_RANK];
        for (old, slot) in axis_map.iter_mut().enumerate() {
            let new = if old < rank { permutation[old] } else { old };
            if new >= rank.max(old + 1) || seen[new] {
                return Err(SipError::InvalidState(format!(
                    "invalid permutation {permutation:?} for rank {rank}"
                )));
            }
            seen[new] = true;
            *slot = new;
        }
        let src_sizes = src_shape.segment_sizes();
        let dst_sizes = dst_shape.segment_sizes();
        for old in 0..MAX_RANK {
            if dst_sizes[axis_map[old]] != src_sizes[old] {
                return Err(SipError::ShapeMismatch {
                    expected: format!("{src_shape} permuted by {permutation:?}"),
                    actual: dst_shape.to_string(),
                });
            }
        }

        let dst_strides = strides(dst_shape);
        let mut idx = [0_usize; MAX_RANK];
        for &value in &src[..src_shape.num_elems()] {
            let target: usize = (0..MAX_RANK)
                .map(|old| idx[old] * dst_strides[axis_map[old]])
                .sum();
            dst[target] = value;
            if !next_index(&mut idx, src_sizes) {
                break;
            }
        }
        Ok(())
    }

    fn slice_extract(
        &self,
        rank: usize,
        src: &[f64],
        src_shape: &BlockShape,
        dst: &mut [f64],
        dst_shape: &BlockShape,
        offsets: &SliceOffsets,
    ) -> Result<()> {
        check_rank(rank)?;
        check_len("source", src.len(), src_shape)?;
        check_len("destination", dst.len(), dst_shape)?;
        check_window(rank, src_shape, dst_shape, offsets)?;

        let src_strides = strides(src_shape);
        let mut idx = [0_usize; MAX_RANK];
        for slot in &mut dst[..dst_shape.num_elems()] {
            *slot = src[window_offset(rank, &idx, offsets, &src_strides)];
            if !next_index(&mut idx, dst_shape.segment_sizes()) {
                break;
            }
        }
        Ok(())
    }

    fn slice_insert(
        &self,
        rank: usize,
        dst: &mut [f64],
        dst_shape: &BlockShape,
        src: &[f64],
        src_shape: &BlockShape,
        offsets: &SliceOffsets,
    ) -> Result<()> {
        check_rank(rank)?;
        check_len("source", src.len(), src_shape)?;
        check_len("destination", dst.len(), dst_shape)?;
        check_window(rank, dst_shape, src_shape, offsets)?;

        let dst_strides = strides(dst_shape);
        let mut idx = [0_usize; MAX_RANK];
        for &value in &src[..src_shape.num_elems()] {
            dst[window_offset(rank, &idx, offsets, &dst_strides)] = value;
            if !next_index(&mut idx, src_shape.segment_sizes()) {
                break;
            }
        }
        Ok(())
    }
}
