//! Block device interface
//!
//! The device is addressed in whole sectors. Sector 0 holds the BIOS
//! parameter block; the FAT region begins at the reserved sector count and
//! the data region follows the FATs and the fixed root directory (if any).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{FsError, FsResult};

pub trait BlockDevice: Send + Sync {
    /// Sector size in bytes. Must match the volume's bytes-per-sector.
    fn block_size(&self) -> usize;

    /// Read one sector into `buf` (`buf.len() == block_size()`).
    fn read_block(&self, sector: u64, buf: &mut [u8]) -> FsResult<()>;

    /// Write one sector from `buf` (`buf.len() == block_size()`).
    fn write_block(&self, sector: u64, buf: &[u8]) -> FsResult<()>;

    /// Flush any volatile device-side state to stable storage.
    fn sync(&self) -> FsResult<()>;
}

/// The device as the core sees it: the raw implementation plus a write
/// gate. When the filesystem root declares the volume corrupted it clears
/// the gate, and every later write is refused with an I/O error before it
/// reaches the hardware.
pub struct Device {
    inner: Arc<dyn BlockDevice>,
    write_enabled: AtomicBool,
}

impl Device {
    pub fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self {
            inner,
            write_enabled: AtomicBool::new(true),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::Relaxed)
    }

    /// One-way gate, pulled by the corruption latch.
    pub fn disable_writes(&self) {
        self.write_enabled.store(false, Ordering::Relaxed);
    }

    pub fn read_block(&self, sector: u64, buf: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len(), self.block_size());
        self.inner.read_block(sector, buf)
    }

    pub fn write_block(&self, sector: u64, buf: &[u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len(), self.block_size());
        if !self.write_enabled() {
            return Err(FsError::Io);
        }
        self.inner.write_block(sector, buf)
    }

    pub fn sync(&self) -> FsResult<()> {
        self.inner.sync()
    }
}
