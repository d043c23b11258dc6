//! Array declarations seen by the server and the block-to-server mapping.

use sip_error::{Result, SipError};
use sip_types::{ArrayId, BlockId, BlockShape, IndexValues, MAX_RANK, UNUSED_INDEX_VALUE};
use std::fmt;

/// What the server needs to know about the served arrays.
pub trait ArrayCatalog: Send + Sync + fmt::Debug {
    fn num_arrays(&self) -> usize;

    /// Number of distinct blocks of `array_id`.
    fn num_blocks(&self, array_id: ArrayId) -> Result<usize>;

    fn block_shape(&self, id: &BlockId) -> Result<BlockShape>;

    /// Position of `id` in `0..num_blocks(id.array_id())`.
    fn block_number(&self, id: &BlockId) -> Result<usize>;

    /// Inverse of [`block_number`](Self::block_number).
    fn block_id(&self, array_id: ArrayId, block_number: usize) -> Result<BlockId>;
}

#[derive(Debug, Clone)]
struct ArrayLayout {
    segment_counts: Vec<usize>,
    shape: BlockShape,
}

/// Arrays whose blocks all share one shape.
///
/// Index values are 1-based segment numbers. Block numbers are row-major:
/// the last used index varies fastest.
#[derive(Debug, Clone, Default)]
pub struct UniformArrayCatalog {
    arrays: Vec<ArrayLayout>,
}

impl UniformArrayCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an array with `segment_counts[i]` segments of
    /// `segment_sizes[i]` elements along dimension `i`.
    pub fn add_array(&mut self, segment_counts: &[usize], segment_sizes: &[usize]) -> Result<ArrayId> {
        if segment_counts.len() != segment_sizes.len() || segment_counts.len() > MAX_RANK {
            return Err(SipError::Config(format!(
                "array rank mismatch: {} segment counts, {} segment sizes (max {MAX_RANK})",
                segment_counts.len(),
                segment_sizes.len()
            )));
        }
        if segment_counts.contains(&0) {
            return Err(SipError::Config("segment counts must be positive".to_owned()));
        }
        let shape =
            BlockShape::from_dims(segment_sizes).map_err(|e| SipError::Config(e.to_string()))?;
        let array_id = u32::try_from(self.arrays.len())
            .map(ArrayId)
            .map_err(|_| SipError::Config("too many arrays".to_owned()))?;
        self.arrays.push(ArrayLayout {
            segment_counts: segment_counts.to_vec(),
            shape,
        });
        Ok(array_id)
    }

    fn layout(&self, array_id: ArrayId) -> Result<&ArrayLayout> {
        self.arrays
            .get(array_id.index())
            .ok_or_else(|| SipError::InvalidState(format!("array {array_id} is not declared")))
    }
}

impl ArrayCatalog for UniformArrayCatalog {
    fn num_arrays(&self) -> usize {
        self.arrays.len()
    }

    fn num_blocks(&self, array_id: ArrayId) -> Result<usize> {
        Ok(self.layout(array_id)?.segment_counts.iter().product())
    }

    fn block_shape(&self, id: &BlockId) -> Result<BlockShape> {
        Ok(self.layout(id.array_id())?.shape)
    }

    fn block_number(&self, id: &BlockId) -> Result<usize> {
        if id.parent().is_some() {
            return Err(SipError::InvalidState(format!(
                "{id} is not a plain block id"
            )));
        }
        let layout = self.layout(id.array_id())?;
        let rank = layout.segment_counts.len();
        let values = id.index_values();
        let mut number = 0_usize;
        for (dim, &count) in layout.segment_counts.iter().enumerate() {
            let segment = usize::try_from(values[dim])
                .ok()
                .filter(|&v| (1..=count).contains(&v))
                .ok_or_else(|| {
                    SipError::InvalidState(format!(
                        "{id}: index {} outside 1..={count} in dimension {dim}",
                        values[dim]
                    ))
                })?;
            number = number * count + (segment - 1);
        }
        if values[rank..].iter().any(|&v| v != UNUSED_INDEX_VALUE) {
            return Err(SipError::InvalidState(format!(
                "{id} uses dimensions beyond rank {rank}"
            )));
        }
        Ok(number)
    }

    fn block_id(&self, array_id: ArrayId, block_number: usize) -> Result<BlockId> {
        let layout = self.layout(array_id)?;
        let num_blocks: usize = layout.segment_counts.iter().product();
        if block_number >= num_blocks {
            return Err(SipError::InvalidState(format!(
                "block number {block_number} outside 0..{num_blocks} of array {array_id}"
            )));
        }
        let mut index_values: IndexValues = [UNUSED_INDEX_VALUE; MAX_RANK];
        let mut rest = block_number;
        for (dim, &count) in layout.segment_counts.iter().enumerate().rev() {
            index_values[dim] = i32::try_from(rest % count + 1)
                .map_err(|_| SipError::Config(format!("segment count {count} exceeds i32")))?;
            rest /= count;
        }
        Ok(BlockId::new(array_id, index_values))
    }
}

/// Round-robin placement of block numbers over the servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDistribution {
    num_servers: usize,
}

impl DataDistribution {
    #[must_use]
    pub fn new(num_servers: usize) -> Self {
        Self {
            num_servers: num_servers.max(1),
        }
    }

    #[must_use]
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    #[must_use]
    pub fn server_for(&self, block_number: usize) -> usize {
        block_number % self.num_servers
    }

    #[must_use]
    pub fn is_my_block(&self, block_number: usize, rank: usize) -> bool {
        self.server_for(block_number) == rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_numbers_are_row_major_and_invertible() {
        let mut catalog = UniformArrayCatalog::new();
        let array = catalog.add_array(&[2, 3], &[4, 5]).expect("array");
        assert_eq!(catalog.num_blocks(array).expect("count"), 6);

        let id = BlockId::from_indices(array, &[2, 1]).expect("id");
        assert_eq!(catalog.block_number(&id).expect("number"), 3);
        for n in 0..6 {
            let id = catalog.block_id(array, n).expect("id");
            assert_eq!(catalog.block_number(&id).expect("number"), n);
        }
        assert_eq!(
            catalog.block_shape(&id).expect("shape").num_elems(),
            20
        );
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let mut catalog = UniformArrayCatalog::new();
        let array = catalog.add_array(&[2], &[1]).expect("array");
        let beyond = BlockId::from_indices(array, &[3]).expect("id");
        assert!(catalog.block_number(&beyond).is_err());
        let extra_dim = BlockId::from_indices(array, &[1, 2]).expect("id");
        assert!(catalog.block_number(&extra_dim).is_err());
        assert!(catalog.block_id(array, 2).is_err());
        assert!(catalog.block_id(ArrayId(7), 0).is_err());
        assert!(catalog.add_array(&[1, 2], &[1]).is_err());
        assert!(catalog.add_array(&[0], &[1]).is_err());
    }

    #[test]
    fn distribution_is_round_robin() {
        let distribution = DataDistribution::new(3);
        let owners: Vec<_> = (0..7).map(|n| distribution.server_for(n)).collect();
        assert_eq!(owners, vec![0, 1, 2, 0, 1, 2, 0]);
        assert!(distribution.is_my_block(4, 1));
        assert_eq!(DataDistribution::new(0).num_servers(), 1);
    }
}
