#![forbid(unsafe_code)]
//! Identifiers and protocol constants shared by workers and servers.
//!
//! A [`BlockId`] names one block of a declared array: a plain block, a
//! contiguous local range (lower bound plus upper-bound parent of the same
//! array) or a subblock (parent block of another array). Ids order by
//! array, then index values, with nested ids after their parent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Highest array rank a SIAL program may declare.
pub const MAX_RANK: usize = 6;

/// Index value stored in the slots of unused trailing dimensions.
pub const UNUSED_INDEX_VALUE: i32 = 1;

/// Number of `i32` words in the wire encoding of a [`BlockId`].
pub const BLOCK_ID_WIRE_LEN: usize = MAX_RANK + 1;

/// Segment selectors, one per dimension.
pub type IndexValues = [i32; MAX_RANK];

/// Index into the program's array table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArrayId(pub u32);

impl ArrayId {
    /// Position of this array in a per-array vector.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank of a worker process within the worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

/// Barrier epoch counter; increases by one at every barrier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectionNumber(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} values, got {actual}")]
    InsufficientData { needed: usize, actual: usize },
    #[error("malformed contiguous range: dimension {dim} has lower {lower} > upper {upper}")]
    MalformedRange { dim: usize, lower: i32, upper: i32 },
    #[error("unsupported block id nesting: {0}")]
    UnsupportedNesting(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("rank {rank} exceeds MAX_RANK {max}", max = MAX_RANK)]
    RankTooLarge { rank: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),
}

// ── BlockShape ──────────────────────────────────────────────────────────────

/// Segment extents of a block; unused trailing dimensions are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockShape {
    segment_sizes: [usize; MAX_RANK],
}

impl BlockShape {
    /// Create a shape from all `MAX_RANK` extents. Every extent must be positive.
    pub fn new(segment_sizes: [usize; MAX_RANK]) -> Result<Self, ParseError> {
        if segment_sizes.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "segment_sizes",
                reason: "every segment size must be positive",
            });
        }
        Ok(Self { segment_sizes })
    }

    /// Create a shape from the extents of the used dimensions.
    pub fn from_dims(dims: &[usize]) -> Result<Self, ParseError> {
        if dims.len() > MAX_RANK {
            return Err(ParseError::RankTooLarge { rank: dims.len() });
        }
        let mut segment_sizes = [1; MAX_RANK];
        segment_sizes[..dims.len()].copy_from_slice(dims);
        Self::new(segment_sizes)
    }

    #[must_use]
    pub fn segment_sizes(&self) -> &[usize; MAX_RANK] {
        &self.segment_sizes
    }

    /// Number of elements in a block of this shape.
    #[must_use]
    pub fn num_elems(&self) -> usize {
        self.segment_sizes.iter().product()
    }
}

impl fmt::Display for BlockShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, size) in self.segment_sizes.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{size}")?;
        }
        write!(f, "]")
    }
}

// ── BlockId ─────────────────────────────────────────────────────────────────

/// Structural kind of a [`BlockId`], derived from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockIdKind {
    /// No parent.
    Plain,
    /// Parent in the same array holding the upper bound of a local range.
    ContiguousLocal,
    /// Parent in a different array.
    Subblock,
}

/// Identifies one block of a declared array.
///
/// A block id may own a parent id. When the parent belongs to the same
/// array, `index_values` is the lower bound and the parent's index values
/// are the upper bound of a contiguous local range. When the parent belongs
/// to a different array the id names a subblock of that parent block. Only
/// one level of nesting is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    array_id: ArrayId,
    index_values: IndexValues,
    parent: Option<Box<BlockId>>,
}

impl BlockId {
    /// Plain block id.
    #[must_use]
    pub fn new(array_id: ArrayId, index_values: IndexValues) -> Self {
        Self {
            array_id,
            index_values,
            parent: None,
        }
    }

    /// Plain block id from the index values of the used dimensions.
    pub fn from_indices(array_id: ArrayId, indices: &[i32]) -> Result<Self, ParseError> {
        if indices.len() > MAX_RANK {
            return Err(ParseError::RankTooLarge {
                rank: indices.len(),
            });
        }
        let mut index_values = [UNUSED_INDEX_VALUE; MAX_RANK];
        index_values[..indices.len()].copy_from_slice(indices);
        Ok(Self::new(array_id, index_values))
    }

    /// Contiguous local range `[lower, upper]` of `array_id`.
    ///
    /// Fails if `lower[i] > upper[i]` for any dimension.
    pub fn contiguous(
        array_id: ArrayId,
        lower: IndexValues,
        upper: IndexValues,
    ) -> Result<Self, ParseError> {
        if let Some(dim) = (0..MAX_RANK).find(|&i| lower[i] > upper[i]) {
            return Err(ParseError::MalformedRange {
                dim,
                lower: lower[dim],
                upper: upper[dim],
            });
        }
        Ok(Self {
            array_id,
            index_values: lower,
            parent: Some(Box::new(Self::new(array_id, upper))),
        })
    }

    /// Subblock `index_values` of `array_id` within the block `parent` of
    /// another array.
    ///
    /// `parent` must be a plain block of a different array.
    pub fn subblock(
        array_id: ArrayId,
        index_values: IndexValues,
        parent: BlockId,
    ) -> Result<Self, ParseError> {
        if parent.array_id == array_id {
            return Err(ParseError::UnsupportedNesting(format!(
                "subblock parent {parent} belongs to the same array"
            )));
        }
        if parent.parent.is_some() {
            return Err(ParseError::UnsupportedNesting(format!(
                "subblock parent {parent} is itself nested"
            )));
        }
        Ok(Self {
            array_id,
            index_values,
            parent: Some(Box::new(parent)),
        })
    }

    #[must_use]
    pub fn array_id(&self) -> ArrayId {
        self.array_id
    }

    /// Rewrite the array id, keeping a contiguous range's upper bound in step.
    pub fn set_array_id(&mut self, array_id: ArrayId) {
        if let Some(parent) = self.parent.as_deref_mut() {
            if parent.array_id == self.array_id {
                parent.array_id = array_id;
            }
        }
        self.array_id = array_id;
    }

    #[must_use]
    pub fn index_values(&self) -> &IndexValues {
        &self.index_values
    }

    #[must_use]
    pub fn parent(&self) -> Option<&BlockId> {
        self.parent.as_deref()
    }

    #[must_use]
    pub fn kind(&self) -> BlockIdKind {
        match self.parent.as_deref() {
            None => BlockIdKind::Plain,
            Some(parent) if parent.array_id == self.array_id => BlockIdKind::ContiguousLocal,
            Some(_) => BlockIdKind::Subblock,
        }
    }

    #[must_use]
    pub fn is_contiguous_local(&self) -> bool {
        self.kind() == BlockIdKind::ContiguousLocal
    }

    #[must_use]
    pub fn is_subblock(&self) -> bool {
        self.kind() == BlockIdKind::Subblock
    }

    /// Upper bound of a contiguous local range, `None` for other kinds.
    #[must_use]
    pub fn upper_index_values(&self) -> Option<&IndexValues> {
        match self.kind() {
            BlockIdKind::ContiguousLocal => self.parent.as_deref().map(|p| &p.index_values),
            BlockIdKind::Plain | BlockIdKind::Subblock => None,
        }
    }

    /// Number of leading dimensions whose index value is not the unused marker.
    #[must_use]
    pub fn rank_in_use(&self) -> usize {
        self.index_values
            .iter()
            .rposition(|&v| v != UNUSED_INDEX_VALUE)
            .map_or(0, |pos| pos + 1)
    }

    /// Lower and upper bounds; a plain block is the degenerate range `[v, v]`.
    fn bounds(&self) -> Option<(&IndexValues, &IndexValues)> {
        match self.kind() {
            BlockIdKind::Plain => Some((&self.index_values, &self.index_values)),
            BlockIdKind::ContiguousLocal => self
                .parent
                .as_deref()
                .map(|p| (&self.index_values, &p.index_values)),
            BlockIdKind::Subblock => None,
        }
    }

    /// For a contiguous range, `lower[i] <= upper[i]` in every dimension.
    /// Always true for other kinds.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.upper_index_values() {
            Some(upper) => (0..MAX_RANK).all(|i| self.index_values[i] <= upper[i]),
            None => true,
        }
    }

    /// Same array and intersecting in every dimension.
    ///
    /// Plain blocks overlap only when identical; subblocks only when equal.
    #[must_use]
    pub fn overlaps(&self, other: &BlockId) -> bool {
        if self.array_id != other.array_id {
            return false;
        }
        match (self.bounds(), other.bounds()) {
            (Some((lo, hi)), Some((other_lo, other_hi))) => {
                !(0..MAX_RANK).any(|i| other_hi[i] < lo[i] || hi[i] < other_lo[i])
            }
            _ => self == other,
        }
    }

    /// Whether this contiguous range contains `other`'s range dimension-wise.
    ///
    /// Both ids must be contiguous local ranges of the same array.
    #[must_use]
    pub fn encloses(&self, other: &BlockId) -> bool {
        if self.array_id != other.array_id {
            return false;
        }
        match (self.upper_index_values(), other.upper_index_values()) {
            (Some(upper), Some(other_upper)) => (0..MAX_RANK).all(|i| {
                self.index_values[i] <= other.index_values[i] && other_upper[i] <= upper[i]
            }),
            _ => false,
        }
    }

    /// Flat wire form: array id followed by the index values. The parent is
    /// not transmitted.
    #[must_use]
    pub fn to_wire(&self) -> [i32; BLOCK_ID_WIRE_LEN] {
        let mut buf = [0_i32; BLOCK_ID_WIRE_LEN];
        buf[0] = i32::try_from(self.array_id.0).unwrap_or(i32::MAX);
        buf[1..].copy_from_slice(&self.index_values);
        buf
    }

    /// Decode the flat wire form produced by [`BlockId::to_wire`].
    pub fn from_wire(buf: &[i32]) -> Result<Self, ParseError> {
        if buf.len() < BLOCK_ID_WIRE_LEN {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_ID_WIRE_LEN,
                actual: buf.len(),
            });
        }
        let array_id = u32::try_from(buf[0]).map_err(|_| ParseError::InvalidField {
            field: "array_id",
            reason: "must be non-negative",
        })?;
        let mut index_values = [0_i32; MAX_RANK];
        index_values.copy_from_slice(&buf[1..BLOCK_ID_WIRE_LEN]);
        Ok(Self::new(ArrayId(array_id), index_values))
    }
}

fn cmp_index_values(lhs: &IndexValues, rhs: &IndexValues) -> Ordering {
    lhs.iter().cmp(rhs.iter())
}

/// Sort rank of plain ids and ranges that share a lower bound.
fn local_kind_rank(kind: BlockIdKind) -> u8 {
    match kind {
        BlockIdKind::Plain => 0,
        BlockIdKind::ContiguousLocal => 1,
        BlockIdKind::Subblock => 2,
    }
}

/// Ids order by array first. Within an array, plain ids and ranges order by
/// their lower bound, and a range sorts right after the plain id equal to
/// its lower bound; ranges sharing a lower bound order by upper bound.
/// Subblocks sort after every plain id and range of the array, by parent
/// and then by index values.
impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.array_id.cmp(&other.array_id) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (self.kind(), other.kind()) {
            (BlockIdKind::Subblock, BlockIdKind::Subblock) => self
                .parent
                .cmp(&other.parent)
                .then_with(|| cmp_index_values(&self.index_values, &other.index_values)),
            (BlockIdKind::Subblock, _) => Ordering::Greater,
            (_, BlockIdKind::Subblock) => Ordering::Less,
            (kind, other_kind) => cmp_index_values(&self.index_values, &other.index_values)
                .then_with(|| local_kind_rank(kind).cmp(&local_kind_rank(other_kind)))
                .then_with(|| self.parent.cmp(&other.parent)),
        }
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.array_id)?;
        match self.upper_index_values() {
            Some(upper) => {
                for i in 0..MAX_RANK {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}..{}", self.index_values[i], upper[i])?;
                }
                write!(f, "]")
            }
            None => {
                for (i, v) in self.index_values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")?;
                match self.parent.as_deref() {
                    Some(parent) => write!(f, " in {parent}"),
                    None => Ok(()),
                }
            }
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────────────

/// Worker → server request types, with their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageType {
    Delete = 0,
    Get = 1,
    Put = 2,
    PutData = 3,
    PutAccumulate = 4,
    PutAccumulateData = 5,
    Barrier = 6,
    EndProgram = 7,
    SetPersistent = 8,
    RestorePersistent = 9,
    PutIncrement = 10,
    PutScale = 11,
    PutInitialize = 12,
}

impl MessageType {
    #[must_use]
    pub fn wire_value(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MessageType {
    type Error = ParseError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Delete,
            1 => Self::Get,
            2 => Self::Put,
            3 => Self::PutData,
            4 => Self::PutAccumulate,
            5 => Self::PutAccumulateData,
            6 => Self::Barrier,
            7 => Self::EndProgram,
            8 => Self::SetPersistent,
            9 => Self::RestorePersistent,
            10 => Self::PutIncrement,
            11 => Self::PutScale,
            12 => Self::PutInitialize,
            other => return Err(ParseError::UnknownMessageType(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn range(array: u32, lower: IndexValues, upper: IndexValues) -> BlockId {
        BlockId::contiguous(ArrayId(array), lower, upper).expect("well formed range")
    }

    #[test]
    fn contiguous_ranges_compare_lower_then_upper() {
        let id1 = range(2, [2, 3, 2, 3, 2, 3], [3, 4, 3, 4, 3, 4]);
        let id2 = range(2, [2, 3, 2, 3, 2, 3], [3, 4, 3, 4, 3, 4]);
        assert_eq!(id1, id2);
        assert!(!(id1 < id2));
        assert!(!(id2 < id1));

        let id3 = range(2, [3, 3, 2, 3, 2, 3], [3, 3, 2, 3, 2, 3]);
        assert!(id1 < id3);

        let id4 = range(2, [3, 5, 3, 4, 3, 4], [3, 5, 3, 4, 3, 4]);
        assert!(id1 < id4);

        let id5 = range(3, [2, 3, 2, 3, 2, 3], [3, 4, 3, 4, 3, 4]);
        assert!(id1 < id5);
        assert!(id4 < id5);
    }

    #[test]
    fn enclosing_range_overlaps_both_ways() {
        let id6 = range(2, [4, 4, -1, -1, -1, -1], [8, 8, -1, -1, -1, -1]);
        let id7 = range(2, [6, 8, -1, -1, -1, -1], [8, 8, -1, -1, -1, -1]);
        assert!(id6.encloses(&id7));
        assert!(!id7.encloses(&id6));
        assert!(id6.overlaps(&id7));
        assert!(id7.overlaps(&id6));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = BlockId::contiguous(ArrayId(2), [2, 3, 2, 3, 2, 3], [2, 2, 3, 4, 3, 4])
            .expect_err("upper below lower in dimension 1");
        assert_eq!(
            err,
            ParseError::MalformedRange {
                dim: 1,
                lower: 3,
                upper: 2
            }
        );
    }

    #[test]
    fn self_comparison_is_not_less() {
        let id = BlockId::from_indices(ArrayId(0), &[1, 2]).expect("id");
        assert!(!(id < id));
        assert_eq!(id.cmp(&id), Ordering::Equal);
    }

    #[test]
    fn plain_blocks_order_lexicographically() {
        let a = BlockId::from_indices(ArrayId(1), &[1, 5]).expect("a");
        let b = BlockId::from_indices(ArrayId(1), &[2, 1]).expect("b");
        let c = BlockId::from_indices(ArrayId(0), &[9, 9]).expect("c");
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn subblock_parent_must_belong_to_another_array() {
        let same_array = BlockId::from_indices(ArrayId(1), &[2, 2]).expect("parent");
        assert!(BlockId::subblock(ArrayId(1), [1; MAX_RANK], same_array).is_err());

        let other_array = BlockId::from_indices(ArrayId(4), &[2, 2]).expect("parent");
        let sub = BlockId::subblock(ArrayId(1), [1; MAX_RANK], other_array.clone())
            .expect("subblock");
        assert!(sub.is_subblock());
        assert_eq!(sub.parent(), Some(&other_array));
    }

    #[test]
    fn range_sorts_right_after_its_lower_bound() {
        let lower = [1, 1, 1, 1, 1, 1];
        let upper = [2, 2, 1, 1, 1, 1];
        let plain_lower = BlockId::new(ArrayId(3), lower);
        let ranged = range(3, lower, upper);
        let next = BlockId::new(ArrayId(3), [1, 1, 1, 1, 1, 2]);
        assert!(plain_lower < ranged);
        assert!(ranged > plain_lower);
        assert!(ranged < next);
        assert!(ranged < BlockId::new(ArrayId(3), upper));
    }

    #[test]
    fn plain_ids_and_ranges_share_one_order() {
        let c1 = range(0, [1, 1, 1, 1, 1, 1], [3, 1, 1, 1, 1, 1]);
        let c2 = range(0, [2, 2, 1, 1, 1, 1], [2, 2, 1, 1, 1, 1]);
        let x = BlockId::from_indices(ArrayId(0), &[2, 5]).expect("x");
        assert!(c1 < c2);
        assert!(c2 < x);
        assert!(c1 < x);

        let ids = [c1, c2, x];
        for first in 0..ids.len() {
            let mut map = std::collections::BTreeMap::new();
            for offset in 0..ids.len() {
                let n = (first + offset) % ids.len();
                map.insert(ids[n].clone(), n);
            }
            for (n, id) in ids.iter().enumerate() {
                assert_eq!(map.get(id), Some(&n), "lookup of {id}");
            }
        }
    }

    #[test]
    fn subblocks_sort_after_local_ids() {
        let parent = BlockId::from_indices(ArrayId(0), &[1]).expect("parent");
        let sub = BlockId::subblock(ArrayId(1), [1; MAX_RANK], parent).expect("sub");
        let plain = BlockId::new(ArrayId(1), [9; MAX_RANK]);
        let ranged = range(1, [9; MAX_RANK], [9; MAX_RANK]);
        assert!(plain < sub);
        assert!(ranged < sub);
        assert!(sub > ranged);
    }

    #[test]
    fn both_subblocks_compare_parents_first() {
        let p1 = BlockId::from_indices(ArrayId(0), &[1]).expect("p1");
        let p2 = BlockId::from_indices(ArrayId(0), &[2]).expect("p2");
        let s1 = BlockId::subblock(ArrayId(5), [9; MAX_RANK], p1.clone()).expect("s1");
        let s2 = BlockId::subblock(ArrayId(5), [1; MAX_RANK], p2).expect("s2");
        let s3 = BlockId::subblock(ArrayId(5), [10; MAX_RANK], p1).expect("s3");
        assert!(s1 < s2);
        assert!(s1 < s3);
        assert!(s3 < s2);
    }

    #[test]
    fn nested_subblock_parent_is_rejected() {
        let root = BlockId::from_indices(ArrayId(0), &[1]).expect("root");
        let sub = BlockId::subblock(ArrayId(1), [1; MAX_RANK], root).expect("sub");
        let err = BlockId::subblock(ArrayId(2), [1; MAX_RANK], sub).expect_err("two levels");
        assert!(matches!(err, ParseError::UnsupportedNesting(_)));
    }

    #[test]
    fn plain_blocks_overlap_only_when_identical() {
        let a = BlockId::from_indices(ArrayId(1), &[1, 2]).expect("a");
        let b = BlockId::from_indices(ArrayId(1), &[1, 3]).expect("b");
        assert!(a.overlaps(&a.clone()));
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn set_array_id_moves_range_upper_bound() {
        let mut id = range(2, [1; MAX_RANK], [2; MAX_RANK]);
        id.set_array_id(ArrayId(7));
        assert_eq!(id.array_id(), ArrayId(7));
        assert!(id.is_contiguous_local());
        assert_eq!(id.upper_index_values(), Some(&[2; MAX_RANK]));
    }

    #[test]
    fn wire_form_drops_parent() {
        let id = range(3, [1, 2, 3, 4, 5, 6], [2, 3, 4, 5, 6, 7]);
        let wire = id.to_wire();
        assert_eq!(wire, [3, 1, 2, 3, 4, 5, 6]);
        let decoded = BlockId::from_wire(&wire).expect("decode");
        assert_eq!(decoded.kind(), BlockIdKind::Plain);
        assert_eq!(decoded.index_values(), id.index_values());
        assert!(BlockId::from_wire(&wire[..3]).is_err());
        assert!(BlockId::from_wire(&[-1, 1, 1, 1, 1, 1, 1]).is_err());
    }

    #[test]
    fn display_renders_kinds() {
        let plain = BlockId::from_indices(ArrayId(2), &[3, 4]).expect("plain");
        assert_eq!(plain.to_string(), "2[3,4,1,1,1,1]");
        let r = range(1, [1, 1, 1, 1, 1, 1], [2, 1, 1, 1, 1, 1]);
        assert_eq!(r.to_string(), "1[1..2,1..1,1..1,1..1,1..1,1..1]");
    }

    #[test]
    fn shape_counts_elements() {
        let shape = BlockShape::from_dims(&[2, 3, 4]).expect("shape");
        assert_eq!(shape.num_elems(), 24);
        assert_eq!(shape.segment_sizes(), &[2, 3, 4, 1, 1, 1]);
        assert!(BlockShape::from_dims(&[2, 0]).is_err());
        assert!(BlockShape::from_dims(&[1; MAX_RANK + 1]).is_err());
    }

    #[test]
    fn rank_in_use_ignores_trailing_unused() {
        let id = BlockId::from_indices(ArrayId(0), &[3, 1, 2]).expect("id");
        assert_eq!(id.rank_in_use(), 3);
        assert_eq!(BlockId::new(ArrayId(0), [1; MAX_RANK]).rank_in_use(), 0);
    }

    #[test]
    fn message_types_round_trip_wire_values() {
        for value in 0..=12 {
            let ty = MessageType::try_from(value).expect("known");
            assert_eq!(ty.wire_value(), value);
        }
        assert_eq!(
            MessageType::try_from(13),
            Err(ParseError::UnknownMessageType(13))
        );
    }

    #[test]
    fn block_id_serializes_with_serde() {
        let id = range(2, [1; MAX_RANK], [3; MAX_RANK]);
        let json = serde_json::to_string(&id).expect("serialize");
        let back: BlockId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    fn plain_id() -> impl Strategy<Value = BlockId> {
        (0_u32..3, proptest::array::uniform6(0_i32..4))
            .prop_map(|(array, values)| BlockId::new(ArrayId(array), values))
    }

    fn range_id() -> impl Strategy<Value = BlockId> {
        (
            0_u32..2,
            proptest::array::uniform6(0_i32..3),
            proptest::array::uniform6(0_i32..3),
        )
            .prop_map(|(array, lower, extent)| {
                let mut upper = lower;
                for (u, e) in upper.iter_mut().zip(extent) {
                    *u += e;
                }
                BlockId::contiguous(ArrayId(array), lower, upper).expect("non-negative extent")
            })
    }

    fn subblock_id() -> impl Strategy<Value = BlockId> {
        (0_u32..2, 1_i32..3, proptest::array::uniform6(0_i32..3)).prop_map(
            |(array, parent_index, values)| {
                let parent = BlockId::from_indices(ArrayId(array + 5), &[parent_index])
                    .expect("parent");
                BlockId::subblock(ArrayId(array), values, parent).expect("subblock")
            },
        )
    }

    fn any_id() -> impl Strategy<Value = BlockId> {
        prop_oneof![plain_id(), range_id(), subblock_id()]
    }

    fn assert_strict_weak_order(a: &BlockId, b: &BlockId, c: &BlockId) {
        let outcomes = [a < b, b < a, a == b];
        assert_eq!(outcomes.iter().filter(|&&o| o).count(), 1);
        if a < b && b < c {
            assert!(a < c);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn plain_ordering_is_strict_weak(a in plain_id(), b in plain_id(), c in plain_id()) {
            assert_strict_weak_order(&a, &b, &c);
        }

        #[test]
        fn range_ordering_is_strict_weak(a in range_id(), b in range_id(), c in range_id()) {
            assert_strict_weak_order(&a, &b, &c);
        }

        #[test]
        fn mixed_ordering_is_strict_weak(a in any_id(), b in any_id(), c in any_id()) {
            assert_strict_weak_order(&a, &b, &c);
            assert_strict_weak_order(&b, &c, &a);
            assert_strict_weak_order(&c, &a, &b);
        }

        #[test]
        fn mixed_ids_are_found_in_a_btree_map(
            ids in proptest::collection::vec(any_id(), 1..24)
        ) {
            let mut map = std::collections::BTreeMap::new();
            for (n, id) in ids.iter().enumerate() {
                map.insert(id.clone(), n);
            }
            for id in &ids {
                let last = ids.iter().rposition(|other| other == id).expect("present");
                prop_assert_eq!(map.get(id), Some(&last));
            }
        }

        #[test]
        fn overlap_is_symmetric(a in range_id(), b in range_id()) {
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        }

        #[test]
        fn well_formed_iff_bounds_ordered(
            lower in proptest::array::uniform6(-2_i32..3),
            upper in proptest::array::uniform6(-2_i32..3),
        ) {
            let ordered = (0..MAX_RANK).all(|i| lower[i] <= upper[i]);
            match BlockId::contiguous(ArrayId(0), lower, upper) {
                Ok(id) => {
                    prop_assert!(ordered);
                    prop_assert!(id.is_well_formed());
                }
                Err(_) => prop_assert!(!ordered),
            }
        }

        #[test]
        fn enclosing_range_overlaps(a in range_id(), b in range_id()) {
            if a.encloses(&b) {
                prop_assert!(a.overlaps(&b));
            }
        }
    }
}
