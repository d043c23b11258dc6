//! On-disk backing file of one served array.
//!
//! Every server of the job shares one data file per array. Server `r`
//! owns chunk numbers `n` at offsets `(num_servers * n + r) * chunk_size`
//! doubles, so the layout follows from the header alone.
//!
//! # Format Overview
//!
//! ```text
//! Data file:
//! +------------------+--------+
//! | chunk_size       | 4 bytes| i32 LE, doubles per chunk
//! | num_servers      | 4 bytes| i32 LE
//! +------------------+--------+
//! | doubles          | 8 bytes each, f64 LE, chunk-interleaved
//! +------------------+--------+
//!
//! Index file (written by `write_index`):
//! +------------------+--------+
//! | index_type       | 8 bytes| i64 LE, 77 = dense, 88 = sparse
//! | count            | 8 bytes| i64 LE
//! +------------------+--------+
//! | dense:  count offsets (i64 LE), -1 = block absent
//! | sparse: count block numbers (i64 LE), then count offsets (i64 LE)
//! +------------------+--------+
//! ```
//!
//! Offsets in the index are in doubles from the end of the data header.
//!
//! # Invariants
//!
//! - Rank 0 writes the header before any other rank opens the file.
//! - `*_all` I/O is collective: one I/O call plus a barrier. A server with
//!   no I/O left issues the matching `*_nop` call.

use crate::collective::Collective;
use crate::device::{ByteDevice, FileByteDevice, MemoryByteDevice};
use sip_error::{Result, SipError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Data file header length in bytes.
pub const HEADER_SIZE: usize = 8;

/// Index file header length in bytes.
pub const INDEX_HEADER_SIZE: usize = 16;

pub const INDEX_TYPE_DENSE: i64 = 77;
pub const INDEX_TYPE_SPARSE: i64 = 88;

/// Dense index slot of a block with no data.
pub const ABSENT_OFFSET: i64 = -1;

const DOUBLE_BYTES: usize = std::mem::size_of::<f64>();

// ── Header ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayFileHeader {
    pub chunk_size: i32,
    pub num_servers: i32,
}

#[must_use]
pub fn encode_header(header: &ArrayFileHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0_u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&header.chunk_size.to_le_bytes());
    buf[4..8].copy_from_slice(&header.num_servers.to_le_bytes());
    buf
}

pub fn decode_header(bytes: &[u8]) -> Result<ArrayFileHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(SipError::Format(format!(
            "array file header needs {HEADER_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    let header = ArrayFileHeader {
        chunk_size: read_i32(&bytes[0..4])?,
        num_servers: read_i32(&bytes[4..8])?,
    };
    if header.chunk_size <= 0 || header.num_servers <= 0 {
        return Err(SipError::Format(format!(
            "invalid array file header: chunk_size={} num_servers={}",
            header.chunk_size, header.num_servers
        )));
    }
    Ok(header)
}

fn read_i32(bytes: &[u8]) -> Result<i32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| SipError::Format("short i32 field".to_owned()))?;
    Ok(i32::from_le_bytes(arr))
}

fn read_i64(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SipError::Format("short i64 field".to_owned()))?;
    Ok(i64::from_le_bytes(arr))
}

fn encode_i64s(values: impl IntoIterator<Item = i64>, out: &mut Vec<u8>) {
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn decode_i64s(bytes: &[u8]) -> Result<Vec<i64>> {
    bytes.chunks_exact(8).map(read_i64).collect()
}

// ── Index ───────────────────────────────────────────────────────────────────

/// Block number to file offset map of a persisted array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileIndex {
    /// One slot per block number, [`ABSENT_OFFSET`] where a block has no data.
    Dense(Vec<i64>),
    /// Parallel lists of present block numbers and their offsets.
    Sparse {
        block_numbers: Vec<i64>,
        offsets: Vec<i64>,
    },
}

impl FileIndex {
    /// Pick the smaller encoding of `dense`: sparse when fewer than half of
    /// the slots hold an offset.
    #[must_use]
    pub fn from_dense(dense: &[i64]) -> Self {
        let present = dense.iter().filter(|&&o| o >= 0).count();
        if present * 2 >= dense.len() {
            return Self::Dense(dense.to_vec());
        }
        let (block_numbers, offsets) = dense
            .iter()
            .enumerate()
            .filter(|&(_, &offset)| offset >= 0)
            .map(|(block_number, &offset)| (len_i64(block_number), offset))
            .unzip();
        Self::Sparse {
            block_numbers,
            offsets,
        }
    }

    /// Expand to one slot per block number.
    pub fn to_dense(&self, num_blocks: usize) -> Result<Vec<i64>> {
        match self {
            Self::Dense(offsets) => {
                if offsets.len() != num_blocks {
                    return Err(SipError::Format(format!(
                        "dense index holds {} blocks, array has {num_blocks}",
                        offsets.len()
                    )));
                }
                Ok(offsets.clone())
            }
            Self::Sparse {
                block_numbers,
                offsets,
            } => {
                let mut dense = vec![ABSENT_OFFSET; num_blocks];
                for (&block_number, &offset) in block_numbers.iter().zip(offsets) {
                    let slot = usize::try_from(block_number)
                        .ok()
                        .filter(|&n| n < num_blocks)
                        .ok_or_else(|| {
                            SipError::Format(format!(
                                "sparse index block number {block_number} outside 0..{num_blocks}"
                            ))
                        })?;
                    dense[slot] = offset;
                }
                Ok(dense)
            }
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Dense(offsets) => {
                encode_i64s([INDEX_TYPE_DENSE, len_i64(offsets.len())], &mut out);
                encode_i64s(offsets.iter().copied(), &mut out);
            }
            Self::Sparse {
                block_numbers,
                offsets,
            } => {
                encode_i64s([INDEX_TYPE_SPARSE, len_i64(offsets.len())], &mut out);
                encode_i64s(block_numbers.iter().copied(), &mut out);
                encode_i64s(offsets.iter().copied(), &mut out);
            }
        }
        out
    }

    /// Decode the index header and return the payload length in bytes.
    pub fn decode_header(bytes: &[u8]) -> Result<(i64, usize)> {
        if bytes.len() < INDEX_HEADER_SIZE {
            return Err(SipError::Format(format!(
                "index header needs {INDEX_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let index_type = read_i64(&bytes[0..8])?;
        let count = usize::try_from(read_i64(&bytes[8..16])?)
            .map_err(|_| SipError::Format("negative index count".to_owned()))?;
        let slots = match index_type {
            INDEX_TYPE_DENSE => count,
            INDEX_TYPE_SPARSE => count * 2,
            other => {
                return Err(SipError::Format(format!("unknown index type {other}")));
            }
        };
        Ok((index_type, slots * 8))
    }

    pub fn decode(index_type: i64, payload: &[u8]) -> Result<Self> {
        let values = decode_i64s(payload)?;
        match index_type {
            INDEX_TYPE_DENSE => Ok(Self::Dense(values)),
            INDEX_TYPE_SPARSE => {
                let half = values.len() / 2;
                Ok(Self::Sparse {
                    block_numbers: values[..half].to_vec(),
                    offsets: values[half..].to_vec(),
                })
            }
            other => Err(SipError::Format(format!("unknown index type {other}"))),
        }
    }
}

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

// ── ArrayFile ───────────────────────────────────────────────────────────────

/// Shared data and index file of one array, plus persistence label.
#[derive(Debug)]
pub struct ArrayFile {
    data: Arc<dyn ByteDevice>,
    index: Arc<dyn ByteDevice>,
    header: ArrayFileHeader,
    collective: Arc<dyn Collective>,
    label: Option<String>,
    path: Option<PathBuf>,
}

fn index_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("idx")
}

fn header_for(chunk_size: usize, collective: &dyn Collective) -> Result<ArrayFileHeader> {
    let chunk_size = i32::try_from(chunk_size)
        .ok()
        .filter(|&c| c > 0)
        .ok_or_else(|| {
            SipError::Config(format!("chunk_size {chunk_size} must be in 1..=i32::MAX"))
        })?;
    let num_servers = i32::try_from(collective.size())
        .map_err(|_| SipError::Config("too many servers".to_owned()))?;
    Ok(ArrayFileHeader {
        chunk_size,
        num_servers,
    })
}

fn create_files(path: &Path, header: &ArrayFileHeader) -> Result<FileByteDevice> {
    let data = FileByteDevice::create(path)?;
    data.write_all_at(0, &encode_header(header))?;
    FileByteDevice::create(index_path(path))?;
    Ok(data)
}

impl ArrayFile {
    /// Collectively create the file at `path` and its companion index.
    ///
    /// Rank 0 creates and writes the header; the others open after a barrier.
    pub fn create(
        path: impl AsRef<Path>,
        chunk_size: usize,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let header = header_for(chunk_size, collective.as_ref())?;
        let created = (collective.rank() == 0).then(|| create_files(path, &header));
        collective.barrier()?;
        let data = match created {
            Some(result) => result?,
            None => FileByteDevice::open(path)?,
        };
        let index = FileByteDevice::open(index_path(path))?;
        debug!(path = %path.display(), chunk_size, "created array file");
        Ok(Self {
            data: Arc::new(data),
            index: Arc::new(index),
            header,
            collective,
            label: None,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing file written by a group of the same size.
    pub fn open(path: impl AsRef<Path>, collective: Arc<dyn Collective>) -> Result<Self> {
        let path = path.as_ref();
        let data = FileByteDevice::open(path)?;
        let mut raw = [0_u8; HEADER_SIZE];
        data.read_exact_at(0, &mut raw)?;
        let header = decode_header(&raw)?;
        if usize::try_from(header.num_servers).ok() != Some(collective.size()) {
            return Err(SipError::Format(format!(
                "{} was written by {} servers, group has {}",
                path.display(),
                header.num_servers,
                collective.size()
            )));
        }
        let index = FileByteDevice::open(index_path(path))?;
        Ok(Self {
            data: Arc::new(data),
            index: Arc::new(index),
            header,
            collective,
            label: None,
            path: Some(path.to_path_buf()),
        })
    }

    /// File held in memory. Only meaningful for a single-server group
    /// unless the devices are shared through [`ArrayFile::with_devices`].
    pub fn in_memory(chunk_size: usize, collective: Arc<dyn Collective>) -> Result<Self> {
        Self::with_devices(
            Arc::new(MemoryByteDevice::new()),
            Arc::new(MemoryByteDevice::new()),
            chunk_size,
            collective,
        )
    }

    /// Collectively create a file over caller-supplied devices shared by
    /// every rank.
    pub fn with_devices(
        data: Arc<dyn ByteDevice>,
        index: Arc<dyn ByteDevice>,
        chunk_size: usize,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        let header = header_for(chunk_size, collective.as_ref())?;
        let written = if collective.rank() == 0 {
            data.write_all_at(0, &encode_header(&header))
        } else {
            Ok(())
        };
        collective.barrier()?;
        written?;
        Ok(Self {
            data,
            index,
            header,
            collective,
            label: None,
            path: None,
        })
    }

    #[must_use]
    pub fn header(&self) -> ArrayFileHeader {
        self.header
    }

    /// Doubles per chunk.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        usize::try_from(self.header.chunk_size).unwrap_or(0)
    }

    #[must_use]
    pub fn num_servers(&self) -> usize {
        usize::try_from(self.header.num_servers).unwrap_or(0)
    }

    #[must_use]
    pub fn collective(&self) -> &Arc<dyn Collective> {
        &self.collective
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn byte_offset(offset_doubles: usize) -> Result<u64> {
        offset_doubles
            .checked_mul(DOUBLE_BYTES)
            .and_then(|b| b.checked_add(HEADER_SIZE))
            .and_then(|b| u64::try_from(b).ok())
            .ok_or_else(|| SipError::Format(format!("chunk offset {offset_doubles} overflows")))
    }

    // ── Chunk I/O ───────────────────────────────────────────────────────────

    /// Write `data` at `offset_doubles`. Independent, not collective.
    pub fn chunk_write(&self, offset_doubles: usize, data: &[f64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(data.len() * DOUBLE_BYTES);
        for value in data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.data
            .write_all_at(Self::byte_offset(offset_doubles)?, &bytes)
    }

    /// Read `buf.len()` doubles at `offset_doubles`. Independent, not collective.
    pub fn chunk_read(&self, offset_doubles: usize, buf: &mut [f64]) -> Result<()> {
        let mut bytes = vec![0_u8; buf.len() * DOUBLE_BYTES];
        self.data
            .read_exact_at(Self::byte_offset(offset_doubles)?, &mut bytes)?;
        for (value, raw) in buf.iter_mut().zip(bytes.chunks_exact(DOUBLE_BYTES)) {
            let arr: [u8; 8] = raw
                .try_into()
                .map_err(|_| SipError::Format("short f64".to_owned()))?;
            *value = f64::from_le_bytes(arr);
        }
        Ok(())
    }

    /// Collective write: every rank calls this or [`chunk_write_all_nop`](Self::chunk_write_all_nop).
    pub fn chunk_write_all(&self, offset_doubles: usize, data: &[f64]) -> Result<()> {
        let written = self.chunk_write(offset_doubles, data);
        self.collective.barrier()?;
        written
    }

    pub fn chunk_write_all_nop(&self) -> Result<()> {
        self.collective.barrier()
    }

    /// Collective read: every rank calls this or [`chunk_read_all_nop`](Self::chunk_read_all_nop).
    pub fn chunk_read_all(&self, offset_doubles: usize, buf: &mut [f64]) -> Result<()> {
        let read = self.chunk_read(offset_doubles, buf);
        self.collective.barrier()?;
        read
    }

    pub fn chunk_read_all_nop(&self) -> Result<()> {
        self.collective.barrier()
    }

    // ── Index ───────────────────────────────────────────────────────────────

    /// Collectively write the index. `dense` holds this server's offsets and
    /// [`ABSENT_OFFSET`] elsewhere; on return it holds the merged index.
    pub fn write_index(&self, dense: &mut [i64]) -> Result<()> {
        self.collective.all_reduce_max_in_place(dense)?;
        let written = if self.collective.rank() == 0 {
            let index = FileIndex::from_dense(dense);
            debug!(
                blocks = dense.len(),
                sparse = matches!(index, FileIndex::Sparse { .. }),
                "write index"
            );
            self.index
                .write_all_at(0, &index.encode())
                .and_then(|()| self.index.sync())
        } else {
            Ok(())
        };
        self.collective.barrier()?;
        written
    }

    /// Read the index as one offset per block number.
    pub fn read_index(&self, num_blocks: usize) -> Result<Vec<i64>> {
        let mut raw = [0_u8; INDEX_HEADER_SIZE];
        self.index.read_exact_at(0, &mut raw)?;
        let (index_type, payload_len) = FileIndex::decode_header(&raw)?;
        let mut payload = vec![0_u8; payload_len];
        self.index
            .read_exact_at(u64::try_from(INDEX_HEADER_SIZE).unwrap_or(16), &mut payload)?;
        FileIndex::decode(index_type, &payload)?.to_dense(num_blocks)
    }

    // ── Persistence label ───────────────────────────────────────────────────

    /// Record that this file holds the persistent array `label`.
    pub fn mark_persistent(&mut self, label: &str) {
        if let Some(existing) = &self.label {
            warn!(old = %existing, new = %label, "array file relabelled");
        }
        self.label = Some(label.to_owned());
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.label.is_some()
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Flush the data device.
    pub fn sync(&self) -> Result<()> {
        self.data.sync()
    }
}
