//! Range lock manager (§4.4): serializes overlapping transactions on the data file via
//! advisory `fcntl` byte-range locks, plus a whole-file "grow lock" for length-changing writes.
//!
//! `fcntl(2)` record locks are scoped to `(process, inode)`, not to a file descriptor or
//! thread: two threads of the same process racing `F_SETLK` on overlapping ranges never see
//! each other's lock. The kernel lock alone is therefore enough to keep a second *process*
//! out, but not to keep two transactions on the same open handle out of each other's way, which
//! §5 requires. [`ProcessLockTable`] makes up the difference with an in-process wait list gated
//! by a `Condvar`.

use std::os::fd::RawFd;
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::storage;

/// Sentinel byte locked by any operation that extends the file past its current length,
/// serializing growers against each other even though their actual write extents may not
/// overlap (§4.4, §GLOSSARY "Grow lock").
///
/// Must fit `libc::off_t` (`i64`): `fcntl`'s `l_start` is signed, so a value derived from
/// `u64::MAX` wraps negative and the kernel rejects the lock with `EINVAL`. `i64::MAX` is a
/// byte genuinely past any file this platform can represent, not a wrapped one.
pub const GROW_LOCK_OFFSET: u64 = i64::MAX as u64;

/// One inclusive `[start, start+len)` byte extent to lock, already sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockExtent {
    pub start: u64,
    pub len: u64,
}

impl LockExtent {
    fn overlaps(&self, other: &LockExtent) -> bool {
        self.start < other.start + other.len && other.start < self.start + self.len
    }
}

/// In-process wait list backing the same-handle serialization that raw `fcntl` locks can't
/// provide on their own. One table is shared (via `Arc`) by every handle open on the same
/// data file within this process.
#[derive(Debug, Default)]
pub struct ProcessLockTable {
    held: Mutex<Vec<LockExtent>>,
    released: Condvar,
}

impl ProcessLockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(ProcessLockTable {
            held: Mutex::new(Vec::new()),
            released: Condvar::new(),
        })
    }

    /// Blocks until none of `extents` overlaps anything already held in-process, then reserves
    /// them. Paired with [`ProcessLockTable::release`].
    fn acquire(&self, extents: &[LockExtent]) {
        let mut held = self.held.lock();
        loop {
            let blocked = held.iter().any(|h| extents.iter().any(|e| h.overlaps(e)));
            if !blocked {
                held.extend_from_slice(extents);
                return;
            }
            self.released.wait(&mut held);
        }
    }

    fn release(&self, extents: &[LockExtent]) {
        let mut held = self.held.lock();
        for extent in extents {
            if let Some(pos) = held.iter().position(|h| h == extent) {
                held.remove(pos);
            }
        }
        self.released.notify_all();
    }
}

/// RAII guard: releases every lock it acquired when dropped, in the commit engine's
/// "after the data-file writes are durable" window (§4.4).
///
/// Holds a raw fd rather than a borrowed one: a lingering commit keeps this guard alive past
/// the call that staged it, stored alongside the handle's own data-file descriptor rather than
/// borrowing from it, which a lifetime-scoped borrow can't express without the handle
/// borrowing from itself.
pub struct RangeLockGuard {
    fd: RawFd,
    table: Arc<ProcessLockTable>,
    held: Vec<LockExtent>,
}

impl RangeLockGuard {
    /// Acquires exclusive locks over every extent in `extents`, in ascending offset order to
    /// preclude deadlock with peers following the same discipline, plus the grow lock if
    /// `grows` is set. Blocks in-process first (via `table`), then takes the matching `fcntl`
    /// lock so concurrent processes are kept out too.
    pub fn acquire(
        fd: RawFd,
        table: Arc<ProcessLockTable>,
        extents: &[LockExtent],
        grows: bool,
    ) -> Result<Self> {
        let mut sorted = extents.to_vec();
        sorted.sort_by_key(|e| e.start);
        sorted.dedup();
        if grows {
            sorted.push(LockExtent {
                start: GROW_LOCK_OFFSET,
                len: 1,
            });
        }

        table.acquire(&sorted);

        let mut held = Vec::with_capacity(sorted.len());
        for extent in &sorted {
            if let Err(e) = storage::lock_range(fd, extent.start, extent.len, true) {
                table.release(&held);
                table.release(&[*extent]);
                return Err(e);
            }
            trace!("locked range [{}, {})", extent.start, extent.start + extent.len);
            held.push(*extent);
        }
        Ok(RangeLockGuard { fd, table, held })
    }

    /// Acquires nothing — used when the handle's `nolock` flag is set and the caller accepts
    /// responsibility for serialization (§4.4).
    pub fn none(fd: RawFd, table: Arc<ProcessLockTable>) -> Self {
        RangeLockGuard {
            fd,
            table,
            held: Vec::new(),
        }
    }
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        for extent in &self.held {
            if let Err(e) = storage::unlock_range(self.fd, extent.start, extent.len) {
                log::warn!("failed to release range lock: {e}");
            }
        }
        self.table.release(&self.held);
    }
}

/// Computes the union of a transaction's operation extents and whether any operation grows
/// the file past `current_len`.
pub fn extents_for(ops: &[(u64, u64)], current_len: u64) -> (Vec<LockExtent>, bool) {
    let mut extents = Vec::with_capacity(ops.len());
    let mut grows = false;
    for &(offset, length) in ops {
        extents.push(LockExtent { start: offset, len: length });
        if offset + length > current_len {
            grows = true;
        }
    }
    (extents, grows)
}
