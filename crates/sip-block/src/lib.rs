#![forbid(unsafe_code)]
//! Block storage for worker processes.
//!
//! [`Block`] holds the dense data of one block. [`IdBlockMap`] indexes
//! blocks by array and [`BlockId`](sip_types::BlockId). [`CachedBlockMap`]
//! layers a memory budget, an LRU cache of demoted blocks and deferred
//! deletion of blocks with in-flight transfers on top of it.

mod block;
mod cached;
mod id_block_map;
mod kernels;
mod memory;
mod policy;
mod transfer;

pub use block::{Block, BlockFootprint, BlockStatus};
pub use cached::{CacheOptions, CachedBlockMap, DEFAULT_MAX_ALLOCATABLE_BYTES};
pub use id_block_map::{IdBlockMap, PerArrayMap};
pub use kernels::{Permutation, ReferenceKernels, SliceOffsets, TensorKernels};
pub use memory::MemoryTracker;
pub use policy::LruArrayPolicy;
pub use transfer::{AsyncTransfer, PendingTransfer, TransferCompleter, transfer_channel};
