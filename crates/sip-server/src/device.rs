//! Byte-addressed storage behind array files.

use parking_lot::Mutex;
use sip_error::{Result, SipError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Writes past the end grow the device.
pub trait ByteDevice: Send + Sync + std::fmt::Debug {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn range_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| SipError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| SipError::Format(format!("{what} range overflows u64")))
}

/// File-backed device. Shared across threads and processes that open the
/// same path; each I/O is positioned, so there is no shared seek offset.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: Arc<AtomicU64>,
}

impl FileByteDevice {
    /// Create or truncate `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, 0))
    }

    /// Open an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self::from_file(file, len))
    }

    fn from_file(file: File, len: u64) -> Self {
        Self {
            file: Arc::new(file),
            len: Arc::new(AtomicU64::new(len)),
        }
    }

    fn refresh_len(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        self.len.fetch_max(len, Ordering::AcqRel);
        Ok(self.len.load(Ordering::Acquire))
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = range_end(offset, buf.len(), "read")?;
        // Another process may have grown the file since we last looked.
        let len = if end > self.len_bytes() {
            self.refresh_len()?
        } else {
            self.len_bytes()
        };
        if end > len {
            return Err(SipError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={len}",
                buf.len()
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = range_end(offset, buf.len(), "write")?;
        self.file.write_all_at(buf, offset)?;
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Growable in-memory device. Clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start =
            usize::try_from(offset).map_err(|_| SipError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SipError::Format("range overflow".into()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SipError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start =
            usize::try_from(offset).map_err(|_| SipError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SipError::Format("range overflow".into()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
