//! Typed wrappers around positional I/O, sync, truncate, and advisory byte-range locks.
//!
//! This is the only module that talks to the kernel directly; everything above it talks to
//! [`StorageAdapter`] instead of raw file descriptors.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;

use log::trace;

use crate::error::Result;

/// How a range of a file is forced to stable storage.
///
/// Chosen once per [`StorageAdapter`] at construction based on platform support, not decided
/// per call — "an interface with two variants suffices, no runtime polymorphism across
/// operations" (spec design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStrategy {
    /// `sync_file_range` (Linux): syncs only the requested byte range.
    Range,
    /// `fdatasync`/`fsync` of the whole file: used where range-sync isn't available.
    WholeFile,
}

/// Typed positional I/O and durability operations on a single open file.
#[derive(Debug)]
pub struct StorageAdapter {
    file: File,
    strategy: SyncStrategy,
}

impl StorageAdapter {
    /// Wraps an already-open file. The sync strategy is probed once here.
    pub fn new(file: File) -> Self {
        let strategy = if cfg!(target_os = "linux") {
            SyncStrategy::Range
        } else {
            SyncStrategy::WholeFile
        };
        StorageAdapter { file, strategy }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`, retrying short reads.
    /// Read-past-EOF is not an error; returns the short count actually read.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            match nix::sys::uio::pread(self.file.as_fd(), &mut buf[total..], (offset + total as u64) as i64)
            {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Writes exactly `buf.len()` bytes at `offset`, retrying short writes until the whole
    /// buffer lands or an unambiguous error occurs.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            match nix::sys::uio::pwrite(self.file.as_fd(), &buf[total..], (offset + total as u64) as i64)
            {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short write").into());
                }
                Ok(n) => total += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Forces `[offset, offset+len)` to stable storage, or the whole file if range-sync is
    /// unsupported on this platform.
    pub fn sync_range(&self, offset: u64, len: u64) -> Result<()> {
        match self.strategy {
            SyncStrategy::Range => {
                #[cfg(target_os = "linux")]
                {
                    let rc = unsafe {
                        libc::sync_file_range(
                            self.file.as_raw_fd(),
                            offset as libc::off_t,
                            len as libc::off_t,
                            libc::SYNC_FILE_RANGE_WAIT_BEFORE
                                | libc::SYNC_FILE_RANGE_WRITE
                                | libc::SYNC_FILE_RANGE_WAIT_AFTER,
                        )
                    };
                    if rc != 0 {
                        return Err(io::Error::last_os_error().into());
                    }
                    trace!("sync_file_range offset={offset} len={len}");
                    return Ok(());
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let _ = (offset, len);
                    unreachable!("SyncStrategy::Range is only chosen on linux");
                }
            }
            SyncStrategy::WholeFile => {
                nix::unistd::fdatasync(self.file.as_fd())?;
                trace!("fdatasync (whole file, requested range offset={offset} len={len})");
                Ok(())
            }
        }
    }

    /// Truncates (or extends) the file to exactly `len` bytes.
    pub fn truncate(&self, len: u64) -> Result<()> {
        nix::unistd::ftruncate(self.file.as_fd(), len as libc::off_t)?;
        Ok(())
    }

    /// Current file length.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// `fsync`s a directory's fd, used after rename/unlink of journal files so the directory
/// entry change itself is durable, not just the file content.
pub fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    nix::unistd::fsync(dir.as_fd())?;
    Ok(())
}

/// One advisory POSIX byte-range lock request/release, as used by the range lock manager.
///
/// Deliberately `fcntl(2)` record locks (`F_SETLK`/`F_SETLKW`), not `flock(2)`: `flock(2)`
/// cannot express a sub-file byte range, which both per-transaction extents and the grow-lock
/// sentinel require.
///
/// Takes a raw fd rather than a borrowed one: a lingering commit must hold its lock across the
/// call that staged it and the later call that drains it, which the handle's data-file
/// descriptor outlives but a borrow tied to a single call's stack frame would not.
pub fn lock_range(fd: RawFd, start: u64, len: u64, blocking: bool) -> Result<()> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = start as libc::off_t;
    lock.l_len = len as libc::off_t;

    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, &mut lock as *mut libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err.into());
    }
}

/// Releases a previously acquired lock over the same range.
pub fn unlock_range(fd: RawFd, start: u64, len: u64) -> Result<()> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_UNLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = start as libc::off_t;
    lock.l_len = len as libc::off_t;

    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock as *mut libc::flock) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
