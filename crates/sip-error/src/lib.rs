#![forbid(unsafe_code)]
//! Error types for the SIAL block store.
//!
//! # Error Taxonomy
//!
//! The store uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Identifiers | `ParseError` | `sip-types` | Malformed block ids, shapes and wire payloads |
//! | Runtime | `SipError` | `sip-error` (this crate) | Everything returned by block maps, chunk managers and array files |
//!
//! `sip-error` does not depend on `sip-types`. Crates that see both convert
//! with `SipError::Parse(err.to_string())` at the call site.
//!
//! ## Classes
//!
//! Every variant belongs to exactly one [`ErrorClass`], reported by
//! [`SipError::class`]. The mapping is an exhaustive match, so a new variant
//! does not compile until it is classified.
//!
//! | Variant | Class | Typical cause |
//! |---------|-------|---------------|
//! | `DuplicateBlock` | `ProgrammerBug` | Inserting a block id twice |
//! | `OverlappingRange` | `ProgrammerBug` | Contiguous range overlapping a stored range |
//! | `BlockNotFound` | `ProgrammerBug` | Removing or reading a block that was never created |
//! | `ShapeMismatch` | `ProgrammerBug` | `+=` between blocks of different shapes |
//! | `InvalidState` | `ProgrammerBug` | Broken internal precondition (null data, bad chunk offset) |
//! | `Parse` | `ProgrammerBug` | Malformed block id or message type |
//! | `OutOfMemory` | `ResourceExhausted` | Budget and eviction both exhausted |
//! | `NoBlocksToEvict` | `ResourceExhausted` | Eviction policy has no candidate |
//! | `Io` | `Storage` | Array file read/write failure |
//! | `Format` | `Storage` | Corrupt array file header or index |
//! | `Collective` | `Storage` | A server group member vanished mid-collective |
//! | `Config` | `Configuration` | Unparseable or out-of-range options |
//!
//! Conditions that would abort a process in an MPI deployment are returned
//! as `Err`; the embedding server or worker loop decides whether to exit.

use thiserror::Error;

/// Broad failure category used by callers deciding whether to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A broken invariant in the program or the runtime. Not recoverable.
    ProgrammerBug,
    /// Memory budget exhausted after every eviction path was tried.
    ResourceExhausted,
    /// Backing store I/O or on-disk format failure.
    Storage,
    /// Invalid options supplied at startup.
    Configuration,
}

/// Unified error type for all block store operations.
#[derive(Debug, Error)]
pub enum SipError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Array file header or index does not match the expected layout.
    #[error("invalid array file format: {0}")]
    Format(String),

    /// Identifier or wire payload rejected by `sip-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// A block with this id is already present in the map.
    #[error("duplicate block: {0}")]
    DuplicateBlock(String),

    /// A contiguous-local range overlaps a range already stored for the array.
    #[error("contiguous range {new} overlaps stored range {existing}")]
    OverlappingRange { new: String, existing: String },

    /// The requested block does not exist.
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// Element-wise operation applied to blocks of different shapes.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// A runtime precondition does not hold.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Allocation could not be satisfied within the memory budget.
    ///
    /// All quantities are in bytes.
    #[error(
        "out of memory: requested {requested} bytes, budget {budget} bytes, {allocated} bytes allocated"
    )]
    OutOfMemory {
        requested: usize,
        budget: usize,
        allocated: usize,
    },

    /// The eviction policy has no block left to offer.
    #[error("no blocks available for eviction")]
    NoBlocksToEvict,

    /// A collective operation could not complete.
    #[error("collective operation failed: {0}")]
    Collective(String),

    /// Options failed to parse or validate.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SipError {
    /// Category of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DuplicateBlock(_)
            | Self::OverlappingRange { .. }
            | Self::BlockNotFound(_)
            | Self::ShapeMismatch { .. }
            | Self::InvalidState(_)
            | Self::Parse(_) => ErrorClass::ProgrammerBug,
            Self::OutOfMemory { .. } | Self::NoBlocksToEvict => ErrorClass::ResourceExhausted,
            Self::Io(_) | Self::Format(_) | Self::Collective(_) => ErrorClass::Storage,
            Self::Config(_) => ErrorClass::Configuration,
        }
    }

    /// Whether the error reports memory exhaustion rather than a bug.
    #[must_use]
    pub fn is_resource_exhausted(&self) -> bool {
        self.class() == ErrorClass::ResourceExhausted
    }
}

/// Result alias using `SipError`.
pub type Result<T> = std::result::Result<T, SipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_mapping_covers_all_variants() {
        let cases: Vec<(SipError, ErrorClass)> = vec![
            (SipError::Io(std::io::Error::other("test")), ErrorClass::Storage),
            (SipError::Format("bad header".into()), ErrorClass::Storage),
            (SipError::Parse("rank".into()), ErrorClass::ProgrammerBug),
            (SipError::DuplicateBlock("a[1]".into()), ErrorClass::ProgrammerBug),
            (
                SipError::OverlappingRange {
                    new: "a[1..2]".into(),
                    existing: "a[2..3]".into(),
                },
                ErrorClass::ProgrammerBug,
            ),
            (SipError::BlockNotFound("a[1]".into()), ErrorClass::ProgrammerBug),
            (
                SipError::ShapeMismatch {
                    expected: "[2,2]".into(),
                    actual: "[2,3]".into(),
                },
                ErrorClass::ProgrammerBug,
            ),
            (SipError::InvalidState("null data".into()), ErrorClass::ProgrammerBug),
            (
                SipError::OutOfMemory {
                    requested: 8,
                    budget: 0,
                    allocated: 0,
                },
                ErrorClass::ResourceExhausted,
            ),
            (SipError::NoBlocksToEvict, ErrorClass::ResourceExhausted),
            (SipError::Collective("peer gone".into()), ErrorClass::Storage),
            (SipError::Config("chunk_size=0".into()), ErrorClass::Configuration),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.class(), *expected, "wrong class for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let oom = SipError::OutOfMemory {
            requested: 800,
            budget: 1024,
            allocated: 512,
        };
        assert_eq!(
            oom.to_string(),
            "out of memory: requested 800 bytes, budget 1024 bytes, 512 bytes allocated"
        );

        let dup = SipError::DuplicateBlock("2[1,1]".into());
        assert_eq!(dup.to_string(), "duplicate block: 2[1,1]");

        let overlap = SipError::OverlappingRange {
            new: "1[1..2]".into(),
            existing: "1[2..4]".into(),
        };
        assert_eq!(
            overlap.to_string(),
            "contiguous range 1[1..2] overlaps stored range 1[2..4]"
        );

        assert_eq!(
            SipError::NoBlocksToEvict.to_string(),
            "no blocks available for eviction"
        );
    }

    #[test]
    fn io_error_converts_with_question_mark() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("disk gone"))?;
            Ok(())
        }
        let err = fails().expect_err("io error");
        assert!(matches!(err, SipError::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn exhaustion_is_distinguished_from_bugs() {
        assert!(SipError::NoBlocksToEvict.is_resource_exhausted());
        assert!(!SipError::BlockNotFound("x".into()).is_resource_exhausted());
    }
}
