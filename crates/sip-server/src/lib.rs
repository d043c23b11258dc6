#![forbid(unsafe_code)]
//! Server side of the SIAL block store.
//!
//! Served arrays are held by a [`DiskBackedBlockMap`]: block data lives in
//! fixed-size chunks that spill to a per-array [`ArrayFile`] under memory
//! pressure, and whole arrays can be saved under a label and restored later.
//! Every block carries a [`DistributedBlockConsistency`] state machine that
//! flags conflicting accesses from different workers within one section.
//!
//! File I/O that spans the server group goes through the [`Collective`]
//! trait. [`SingleProcess`] serves one server; [`LocalCollective::group`]
//! runs a group of servers as threads of one process.

mod array_file;
mod catalog;
mod chunk;
mod collective;
mod consistency;
mod device;
mod disk_backed;
mod server_block;

pub use array_file::{
    ABSENT_OFFSET, ArrayFile, ArrayFileHeader, FileIndex, HEADER_SIZE, INDEX_HEADER_SIZE,
    INDEX_TYPE_DENSE, INDEX_TYPE_SPARSE, decode_header, encode_header,
};
pub use catalog::{ArrayCatalog, DataDistribution, UniformArrayCatalog};
pub use chunk::{Chunk, ChunkAssignment, ChunkManager};
pub use collective::{Collective, LocalCollective, SingleProcess};
pub use consistency::{ConsistencyMode, DistributedBlockConsistency, WorkerClass};
pub use device::{ByteDevice, FileByteDevice, MemoryByteDevice};
pub use disk_backed::{DEFAULT_CHUNK_SIZE, DiskBackedBlockMap, ServedArray, ServerOptions};
pub use server_block::{
    AsyncOpKind, BlockAsyncManager, DiskBackingState, ServerBlock, ServerBlockMut, StagingBuffer,
};
