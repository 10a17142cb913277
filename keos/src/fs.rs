//! Filesystem abstraction.
//!
//! The paging core consumes two things from the filesystem layer: regular
//! files (the backing store of memory-mapped pages and of lazily loaded
//! program segments) and raw disks (the backing store of the swap area).
//!
//! [`MemFs`] is a small in-memory filesystem that implements
//! [`traits::RegularFile`]. Every operation on it is serialized by a single
//! filesystem-wide lock.

/// Defines traits for file system operations.
pub mod traits {
    use super::{FileBlockNumber, InodeNumber};
    use crate::KernelError;

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports basic read and write
    /// operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the inode number of the file.
        fn ino(&self) -> InodeNumber;

        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file into the provided buffer.
        ///
        /// Bytes of the block that lie beyond the end of the file read as
        /// zero.
        ///
        /// # Returns
        /// - `Ok(true)`: If the block is (at least partially) inside the file.
        /// - `Ok(false)`: If the block lies entirely beyond the end of file.
        /// - `Err(Error)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError>;

        /// Writes a 4096-byte page of data into the specified file block.
        ///
        /// If the target block lies beyond the current end of the file, the
        /// file may be extended up to `min_size` bytes to accommodate the
        /// write. Bytes of `buf` beyond `max(size, min_size)` are discarded.
        ///
        /// # Returns
        /// - `Ok(())` if the write is successful.
        /// - `Err(KernelError)` if the operation fails (e.g., out-of-bounds
        ///   write, the file denies writes).
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; 4096],
            min_size: usize,
        ) -> Result<(), KernelError>;

        /// Forbid writes to this file until [`RegularFile::allow_write`].
        ///
        /// Calls nest: every `deny_write` must be balanced by one
        /// `allow_write`.
        fn deny_write(&self);

        /// Re-allow writes forbidden by [`RegularFile::deny_write`].
        fn allow_write(&self);
    }
}

use crate::{KernelError, sync::SpinLock};
use abyss::dev::{BlockOps, SECTOR_SIZE};
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::num::NonZeroU32;

pub use abyss::dev::Sector;

/// A handle to a regular file.
///
/// This struct provides a reference-counted handle to a file that supports
/// reading and writing operations at the kernel level. Cloning a handle is the
/// kernel's `reopen`: the new handle refers to the same file and stays valid
/// after the original one is closed.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Inode number of the file.
    pub fn ino(&self) -> InodeNumber {
        self.0.ino()
    }

    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Open an independent handle of the same file.
    pub fn reopen(&self) -> Self {
        self.clone()
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data from the file at `position` into the provided buffer.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read. Reading stops at the end of
    ///   file.
    /// - `Err(Error)`: An error if the read operation fails.
    pub fn read(&self, mut position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; 4096]);
        let max_read = self
            .size()
            .min(position + buf.len())
            .saturating_sub(position);
        let mut read_bytes = 0;
        while read_bytes < max_read {
            let ofs = position & 0xfff;
            self.0
                .read(FileBlockNumber::from_offset(position), &mut bounce_buffer)?;
            let chunk = (0x1000 - ofs).min(max_read - read_bytes);
            buf[read_bytes..read_bytes + chunk].copy_from_slice(&bounce_buffer[ofs..ofs + chunk]);
            position += chunk;
            read_bytes += chunk;
        }
        Ok(read_bytes)
    }

    /// Writes data from the buffer into the file at `position`.
    ///
    /// If the write position is beyond the current file size, file will be
    /// extended to minimum size required to reflect the update.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, mut position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; 4096]);
        let mut write_bytes = 0;
        while write_bytes < buf.len() {
            let ofs = position & 0xfff;
            let chunk = (0x1000 - ofs).min(buf.len() - write_bytes);
            let fba = FileBlockNumber::from_offset(position);
            if chunk != 0x1000 {
                self.0.read(fba, &mut bounce_buffer)?;
            }
            bounce_buffer[ofs..ofs + chunk].copy_from_slice(&buf[write_bytes..write_bytes + chunk]);
            self.0.write(fba, &bounce_buffer, position + chunk)?;
            position += chunk;
            write_bytes += chunk;
        }
        Ok(write_bytes)
    }

    /// Forbid writes to the file while the returned guard is alive.
    pub fn deny_write(&self) -> DenyWrite {
        self.0.deny_write();
        DenyWrite(self.clone())
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RegularFile(ino: {})", self.ino().into_u32())
    }
}

/// A guard that keeps a file write-protected.
///
/// Obtained by [`RegularFile::deny_write`]. Writes are allowed again when the
/// guard is dropped.
pub struct DenyWrite(RegularFile);

impl Clone for DenyWrite {
    fn clone(&self) -> Self {
        self.0.deny_write()
    }
}

impl Drop for DenyWrite {
    fn drop(&mut self) {
        self.0.0.allow_write();
    }
}

/// Represents a unique identifier for an inode in the filesystem.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct InodeNumber(NonZeroU32);

impl InodeNumber {
    /// Creates a [`InodeNumber`] if the given value is not zero.
    pub const fn new(n: u32) -> Option<Self> {
        if let Some(v) = NonZeroU32::new(n) {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Returns the contained value as a u32.
    #[inline]
    pub fn into_u32(&self) -> u32 {
        self.0.get()
    }
}

/// Represents a file block number within a file.
///
/// Each block contains 4096 bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Computes the file block number from a byte offset within a file.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / 0x1000)
    }

    /// The byte offset of the first byte of this block.
    pub const fn into_offset(self) -> usize {
        self.0 * 0x1000
    }
}

impl core::ops::Add<usize> for FileBlockNumber {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

struct Inode {
    data: Vec<u8>,
    deny_write_cnt: usize,
}

struct MemFsInner {
    // The filesystem lock.
    inodes: SpinLock<(BTreeMap<String, InodeNumber>, Vec<Inode>)>,
}

/// An in-memory filesystem with a flat namespace.
///
/// A [`MemFs`] is a cheaply clonable handle. Files created in it are opened as
/// [`RegularFile`]s.
#[derive(Clone)]
pub struct MemFs {
    inner: Arc<MemFsInner>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// Create an empty filesystem.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemFsInner {
                inodes: SpinLock::new((BTreeMap::new(), Vec::new())),
            }),
        }
    }

    /// Create a file named `name` holding `contents`.
    ///
    /// # Returns
    /// - `Ok(RegularFile)`: the handle of the created file.
    /// - `Err(KernelError::FileExist)`: if `name` is already taken.
    pub fn create(&self, name: &str, contents: &[u8]) -> Result<RegularFile, KernelError> {
        let mut guard = self.inner.inodes.lock();
        let (names, inodes) = &mut *guard;
        if names.contains_key(name) {
            guard.unlock();
            return Err(KernelError::FileExist);
        }
        let Some(ino) = InodeNumber::new(inodes.len() as u32 + 1) else {
            guard.unlock();
            return Err(KernelError::NoSpace);
        };
        names.insert(name.to_string(), ino);
        inodes.push(Inode {
            data: contents.to_vec(),
            deny_write_cnt: 0,
        });
        guard.unlock();
        Ok(RegularFile::new(MemFile {
            fs: self.inner.clone(),
            ino,
        }))
    }

    /// Open the file named `name`.
    pub fn open(&self, name: &str) -> Result<RegularFile, KernelError> {
        let guard = self.inner.inodes.lock();
        let ino = guard.0.get(name).copied();
        guard.unlock();
        ino.map(|ino| {
            RegularFile::new(MemFile {
                fs: self.inner.clone(),
                ino,
            })
        })
        .ok_or(KernelError::NoSuchEntry)
    }
}

/// A regular file of a [`MemFs`].
pub struct MemFile {
    fs: Arc<MemFsInner>,
    ino: InodeNumber,
}

impl MemFile {
    fn with_inode<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut guard = self.fs.inodes.lock();
        // Inodes are never removed.
        let r = f(&mut guard.1[self.ino.into_u32() as usize - 1]);
        guard.unlock();
        r
    }
}

impl traits::RegularFile for MemFile {
    fn ino(&self) -> InodeNumber {
        self.ino
    }

    fn size(&self) -> usize {
        self.with_inode(|inode| inode.data.len())
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        self.with_inode(|inode| {
            buf.fill(0);
            let ofs = fba.into_offset();
            if ofs >= inode.data.len() {
                return Ok(false);
            }
            let len = (inode.data.len() - ofs).min(4096);
            buf[..len].copy_from_slice(&inode.data[ofs..ofs + len]);
            Ok(true)
        })
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; 4096],
        min_size: usize,
    ) -> Result<(), KernelError> {
        self.with_inode(|inode| {
            if inode.deny_write_cnt != 0 {
                return Err(KernelError::TextFileBusy);
            }
            let ofs = fba.into_offset();
            let size = inode.data.len().max(min_size);
            if ofs >= size {
                return Err(KernelError::InvalidArgument);
            }
            inode.data.resize(size, 0);
            let len = (size - ofs).min(4096);
            inode.data[ofs..ofs + len].copy_from_slice(&buf[..len]);
            Ok(())
        })
    }

    fn deny_write(&self) {
        self.with_inode(|inode| inode.deny_write_cnt += 1)
    }

    fn allow_write(&self) {
        self.with_inode(|inode| {
            assert_ne!(inode.deny_write_cnt, 0, "Unbalanced allow_write.");
            inode.deny_write_cnt -= 1;
        })
    }
}

// The type for disk hooking.
#[doc(hidden)]
pub type Hook = Arc<
    dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync + 'static,
>;

/// The disk, a device that has byte sink.
///
/// A disk wraps a block device. A hook installed with [`Disk::hook`] observes
/// every access before it reaches the device and can fail it.
#[derive(Clone)]
pub struct Disk {
    dev: Arc<dyn BlockOps>,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a new disk on top of the block device.
    pub fn new(dev: Arc<dyn BlockOps>) -> Self {
        Self {
            dev,
            hook: None,
        }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// Number of sectors of the disk.
    pub fn sector_cnt(&self) -> usize {
        self.dev.block_cnt()
    }

    /// Read 512 bytes from disk starting from sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        if self.dev.read(sector, buf) {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }

    /// Write 512 bytes to disk starting from sector.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        if self.dev.write(sector, buf) {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::dev::RamDisk;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn file_read_write() {
        let fs = MemFs::new();
        let file = fs.create("hello", b"Hello, KeOS!").unwrap();
        assert_eq!(
            fs.create("hello", b"").err(),
            Some(KernelError::FileExist),
            "Creating an existing file should fail"
        );
        let mut buf = [0u8; 32];
        assert_eq!(file.read(7, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"KeOS!");

        assert_eq!(file.write(0x1ffe, b"xyz"), Ok(3));
        assert_eq!(file.size(), 0x2001);
        let mut buf = [0xffu8; 4];
        assert_eq!(file.read(0x1ffc, &mut buf), Ok(4));
        assert_eq!(&buf, b"\0\0xy");

        let reopened = fs.open("hello").unwrap();
        assert_eq!(reopened.ino(), file.ino());
        assert_eq!(fs.open("nope").err(), Some(KernelError::NoSuchEntry));
    }

    #[test]
    fn deny_write_is_scoped() {
        let fs = MemFs::new();
        let file = fs.create("exe", &[1; 100]).unwrap();
        let guard = file.deny_write();
        assert_eq!(file.write(0, &[2]), Err(KernelError::TextFileBusy));
        drop(guard);
        assert_eq!(file.write(0, &[2]), Ok(1));
    }

    #[test]
    fn disk_hook_observes_writes() {
        let writes = Arc::new(AtomicUsize::new(0));
        let cnt = writes.clone();
        let disk = Disk::new(Arc::new(RamDisk::new(16))).hook(Arc::new(move |_: Sector, _: &[u8; SECTOR_SIZE], is_write: bool| {
            if is_write {
                cnt.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
        let mut buf = [0u8; SECTOR_SIZE];
        disk.write(Sector(1), &[7; SECTOR_SIZE]).unwrap();
        disk.read(Sector(1), &mut buf).unwrap();
        assert_eq!(buf, [7; SECTOR_SIZE]);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(disk.write(Sector(16), &buf), Err(KernelError::IOError));
    }
}
