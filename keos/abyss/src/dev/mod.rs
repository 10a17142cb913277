//! Devices.
//!
//! The only device class the paging core needs is a block device. A
//! [`RamDisk`] emulates one in host memory; it is what backs the swap disk
//! and the filesystem disk in the hosted build.

use crate::spinlock::SpinLock;
use alloc::{boxed::Box, vec, vec::Vec};

/// Size of a sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Sector(pub usize);

impl Sector {
    /// Get offset that represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// Operations of a block device.
pub trait BlockOps: Send + Sync {
    /// Get total block count of this device.
    fn block_cnt(&self) -> usize;
    /// get block size of this device.
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }
    /// Read 512 bytes from disk starting from sector.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> bool;
    /// Write 512 bytes to disk starting from sector.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> bool;
}

/// A block device that lives in host memory.
///
/// Accesses beyond [`BlockOps::block_cnt`] fail the same way an out-of-range
/// request to a real controller does: the operation reports `false` and the
/// buffer is left untouched.
pub struct RamDisk {
    sectors: SpinLock<Vec<Box<[u8; SECTOR_SIZE]>>>,
}

impl RamDisk {
    /// Create a zero-filled disk of `cnt` sectors.
    pub fn new(cnt: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![Box::new([0; SECTOR_SIZE]); cnt]),
        }
    }

    /// Create a disk that holds at least `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self::new(bytes.div_ceil(SECTOR_SIZE))
    }
}

impl BlockOps for RamDisk {
    fn block_cnt(&self) -> usize {
        let guard = self.sectors.lock();
        let cnt = guard.len();
        guard.unlock();
        cnt
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> bool {
        let guard = self.sectors.lock();
        let ok = match guard.get(sector.into_usize()) {
            Some(s) => {
                buf.copy_from_slice(&s[..]);
                true
            }
            None => false,
        };
        guard.unlock();
        ok
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> bool {
        let mut guard = self.sectors.lock();
        let ok = match guard.get_mut(sector.into_usize()) {
            Some(s) => {
                s.copy_from_slice(buf);
                true
            }
            None => false,
        };
        guard.unlock();
        ok
    }
}
