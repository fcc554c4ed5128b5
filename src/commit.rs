//! The commit state machine (§4.5): stage, lock, journal, apply, sync, unlink.
//!
//! Each step is a plain function that either advances the transaction or returns the failure
//! class the caller must act on, rather than a recursive or coroutine-shaped design.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::journal_dir::JournalDir;
use crate::lock_manager::{self, LockExtent, ProcessLockTable, RangeLockGuard};
use crate::record::{RecordOp, RecordWriter};
use crate::storage::StorageAdapter;
use crate::transaction::{Transaction, TransactionState};

/// What a commit or rollback call returns on success: how many new bytes landed, and whether
/// the data-file apply already ran or was deferred (linger mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Applied all the way to `DONE`; the record has been unlinked.
    Done { bytes_written: u64 },
    /// Stopped at `DURABLE_JOURNAL`: the journal is durable, the data-file apply is deferred.
    Lingering { id: u32, bytes_written: u64 },
}

/// A transaction that reached `DURABLE_JOURNAL` in linger mode and is waiting to be drained.
pub struct LingeringRecord {
    pub id: u32,
    ops: Vec<RecordOp>,
    _lock: RangeLockGuard,
}

impl LingeringRecord {
    pub fn bytes(&self) -> u64 {
        self.ops.iter().map(RecordOp::length).sum()
    }
}

/// Failure discipline required by §4.5/§7: callers must be able to tell "nothing happened"
/// from "the journal is durable, finish or recover".
#[derive(Debug)]
pub enum CommitError {
    /// Failed before `mark_committed`: the partial record was unlinked, nothing is visible.
    AtomicPreserved(Error),
    /// Failed at or after `mark_committed`: the journal is durable, data may be partially
    /// applied; the next recovery pass will finish the job.
    AtomicBroken(Error),
}

impl CommitError {
    pub fn into_inner(self) -> Error {
        match self {
            CommitError::AtomicPreserved(e) | CommitError::AtomicBroken(e) => e,
        }
    }
}

/// Everything the commit engine needs from the owning handle, borrowed for one call.
pub struct CommitContext<'a> {
    pub storage: &'a StorageAdapter,
    pub journal: &'a JournalDir,
    pub lock_table: &'a Arc<ProcessLockTable>,
    pub nolock: bool,
}

/// Runs `t` through the eager path, `NEW` all the way to `DONE`. Linger-mode handles use
/// [`commit_lingering`] instead, which halts at `DURABLE_JOURNAL` and hands back the state
/// needed to resume later.
pub fn commit(
    ctx: &CommitContext<'_>,
    t: &mut Transaction,
) -> std::result::Result<CommitOutcome, CommitError> {
    if t.is_empty() {
        return Err(CommitError::AtomicPreserved(Error::ProtocolMisuse(
            "commit of a transaction with no operations",
        )));
    }
    if matches!(t.state(), TransactionState::Done) {
        return Err(CommitError::AtomicPreserved(Error::ProtocolMisuse(
            "commit of an already-freed transaction",
        )));
    }

    let current_len = ctx
        .storage
        .len()
        .map_err(CommitError::AtomicPreserved)?;
    let (extents, grows): (Vec<LockExtent>, bool) = lock_manager::extents_for(
        &t.ops.iter().map(|op| (op.offset, op.length())).collect::<Vec<_>>(),
        current_len,
    );

    let fd: RawFd = ctx.storage.as_fd().as_raw_fd();
    let guard = if ctx.nolock {
        RangeLockGuard::none(fd, ctx.lock_table.clone())
    } else {
        RangeLockGuard::acquire(fd, ctx.lock_table.clone(), &extents, grows)
            .map_err(CommitError::AtomicPreserved)?
    };
    t.state = TransactionState::Locked;
    trace!("transaction locked over {} extent(s)", extents.len());

    let id = ctx.journal.next_id().map_err(CommitError::AtomicPreserved)?;
    t.id = Some(id);

    let capture_rollback = !t.norollback();
    let ops = match stage_ops(ctx.storage, t, capture_rollback) {
        Ok(ops) => ops,
        Err(e) => {
            let _ = ctx.journal.unlink(id);
            return Err(CommitError::AtomicPreserved(e));
        }
    };

    let path = ctx.journal.path_for(id);
    let mut writer = match RecordWriter::create(&path) {
        Ok(w) => w,
        Err(e) => {
            let _ = ctx.journal.unlink(id);
            return Err(CommitError::AtomicPreserved(e));
        }
    };
    if let Err(e) = writer.write_body(id, &ops, capture_rollback) {
        let _ = ctx.journal.unlink(id);
        return Err(CommitError::AtomicPreserved(e));
    }
    t.state = TransactionState::Journaled;
    debug!("transaction {id}: journaled, committed=0");

    // The atomic-commit point: once this bit is durable, failure is no longer reversible —
    // the journal must be finished, not unwound.
    if let Err(e) = writer.mark_committed() {
        let _ = ctx.journal.unlink(id);
        return Err(CommitError::AtomicPreserved(e));
    }
    t.state = TransactionState::DurableJournal;
    debug!("transaction {id}: durable journal, committed=1");

    let bytes_written = apply_and_finish(ctx, id, &ops, guard).map_err(CommitError::AtomicBroken)?;
    t.state = TransactionState::Done;
    if capture_rollback {
        t.captured = Some(ops);
    }
    Ok(CommitOutcome::Done { bytes_written })
}

/// Variant of [`commit`] for linger mode that also returns the halted [`LingeringRecord`] so
/// the caller can push it onto the handle's lingering list. Kept separate from `commit` because
/// the non-lingering path consumes the lock guard immediately and has no halted state to return.
pub fn commit_lingering(
    ctx: &CommitContext<'_>,
    t: &mut Transaction,
) -> std::result::Result<(CommitOutcome, LingeringRecord), CommitError> {
    if t.is_empty() {
        return Err(CommitError::AtomicPreserved(Error::ProtocolMisuse(
            "commit of a transaction with no operations",
        )));
    }
    if matches!(t.state(), TransactionState::Done) {
        return Err(CommitError::AtomicPreserved(Error::ProtocolMisuse(
            "commit of an already-freed transaction",
        )));
    }

    let current_len = ctx.storage.len().map_err(CommitError::AtomicPreserved)?;
    let (extents, grows) = lock_manager::extents_for(
        &t.ops.iter().map(|op| (op.offset, op.length())).collect::<Vec<_>>(),
        current_len,
    );

    let fd = ctx.storage.as_fd().as_raw_fd();
    let guard = if ctx.nolock {
        RangeLockGuard::none(fd, ctx.lock_table.clone())
    } else {
        RangeLockGuard::acquire(fd, ctx.lock_table.clone(), &extents, grows)
            .map_err(CommitError::AtomicPreserved)?
    };
    t.state = TransactionState::Locked;

    let id = ctx.journal.next_id().map_err(CommitError::AtomicPreserved)?;
    t.id = Some(id);

    let capture_rollback = !t.norollback();
    let ops = match stage_ops(ctx.storage, t, capture_rollback) {
        Ok(ops) => ops,
        Err(e) => {
            let _ = ctx.journal.unlink(id);
            return Err(CommitError::AtomicPreserved(e));
        }
    };

    let path = ctx.journal.path_for(id);
    let mut writer = match RecordWriter::create(&path) {
        Ok(w) => w,
        Err(e) => {
            let _ = ctx.journal.unlink(id);
            return Err(CommitError::AtomicPreserved(e));
        }
    };
    if let Err(e) = writer.write_body(id, &ops, capture_rollback) {
        let _ = ctx.journal.unlink(id);
        return Err(CommitError::AtomicPreserved(e));
    }
    t.state = TransactionState::Journaled;

    if let Err(e) = writer.mark_committed() {
        let _ = ctx.journal.unlink(id);
        return Err(CommitError::AtomicPreserved(e));
    }
    t.state = TransactionState::DurableJournal;
    debug!("transaction {id}: lingering at durable journal, committed=1");

    let bytes_written = ops.iter().map(RecordOp::length).sum();
    if capture_rollback {
        t.captured = Some(ops.clone());
    }
    let lingering = LingeringRecord {
        id,
        ops,
        _lock: guard,
    };
    Ok((
        CommitOutcome::Lingering { id, bytes_written },
        lingering,
    ))
}

/// Drains one lingering record from `DURABLE_JOURNAL` to `DONE`: applies to the data file,
/// fsyncs, unlinks. Used by `sync`/`close`/autosync.
pub fn drain_lingering(journal: &JournalDir, storage: &StorageAdapter, record: LingeringRecord) -> Result<u64> {
    let bytes = apply_and_finish_ops(journal, storage, record.id, &record.ops)?;
    Ok(bytes)
}

fn stage_ops(storage: &StorageAdapter, t: &Transaction, capture_rollback: bool) -> Result<Vec<RecordOp>> {
    let current_len = storage.len()?;
    let mut ops = Vec::with_capacity(t.ops.len());
    for op in &t.ops {
        let old_bytes = if capture_rollback {
            let mut buf = vec![0u8; op.buffer.len()];
            let n = storage.read_at(&mut buf, op.offset)?;
            buf.truncate(n);
            // Pad back to full length with zero so the on-disk op size is fixed; rollback uses
            // `old_file_len` (not buffer length) to know where the real EOF was.
            buf.resize(op.buffer.len(), 0);
            Some(buf)
        } else {
            None
        };
        ops.push(RecordOp {
            offset: op.offset,
            new_bytes: op.buffer.clone(),
            old_bytes,
            old_file_len: current_len,
        });
    }
    Ok(ops)
}

fn apply_and_finish(ctx: &CommitContext<'_>, id: u32, ops: &[RecordOp], guard: RangeLockGuard) -> Result<u64> {
    let bytes = apply_and_finish_ops(ctx.journal, ctx.storage, id, ops)?;
    drop(guard);
    Ok(bytes)
}

fn apply_and_finish_ops(journal: &JournalDir, storage: &StorageAdapter, id: u32, ops: &[RecordOp]) -> Result<u64> {
    let mut bytes_written = 0u64;
    for op in ops {
        storage.write_at(&op.new_bytes, op.offset)?;
        bytes_written += op.length();
    }
    sync_written_extents(storage, ops)?;
    trace!("transaction {id}: applied, data durable");

    journal.unlink(id)?;
    debug!("transaction {id}: done, record unlinked");
    Ok(bytes_written)
}

/// Forces the byte range spanning every op's extent to stable storage, using the adapter's
/// range-sync strategy where available (§4.1) rather than always fsyncing the whole file.
pub(crate) fn sync_written_extents(storage: &StorageAdapter, ops: &[RecordOp]) -> Result<()> {
    let start = ops.iter().map(|op| op.offset).min().unwrap_or(0);
    let end = ops
        .iter()
        .map(|op| op.offset + op.length())
        .max()
        .unwrap_or(0);
    storage.sync_range(start, end.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal_dir::JournalDir;
    use crate::lock_manager::ProcessLockTable;
    use crate::transaction::TransactionFlags;
    use std::fs::OpenOptions;

    fn setup() -> (tempfile::TempDir, StorageAdapter, JournalDir, Arc<ProcessLockTable>) {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)
            .unwrap();
        let storage = StorageAdapter::new(file);
        let jdir_path = JournalDir::default_path_for(&data_path);
        let journal = JournalDir::init(&jdir_path).unwrap();
        let table = ProcessLockTable::new();
        (dir, storage, journal, table)
    }

    #[test]
    fn single_write_commits_eagerly_and_cleans_journal() {
        let (_dir, storage, journal, table) = setup();
        let ctx = CommitContext {
            storage: &storage,
            journal: &journal,
            lock_table: &table,
            nolock: false,
        };
        let mut t = Transaction::new(TransactionFlags::empty());
        t.add_op(b"hello", 0).unwrap();

        match commit(&ctx, &mut t).unwrap() {
            CommitOutcome::Done { bytes_written } => assert_eq!(bytes_written, 5),
            other => panic!("expected Done, got {other:?}"),
        }
        let mut buf = [0u8; 5];
        storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(journal.is_empty_of_records().unwrap());
    }

    #[test]
    fn overlap_inside_transaction_applies_in_order() {
        let (_dir, storage, journal, table) = setup();
        let ctx = CommitContext {
            storage: &storage,
            journal: &journal,
            lock_table: &table,
            nolock: false,
        };
        let mut t = Transaction::new(TransactionFlags::empty());
        t.add_op(b"AAAA", 0).unwrap();
        t.add_op(b"BB", 1).unwrap();

        match commit(&ctx, &mut t).unwrap() {
            CommitOutcome::Done { bytes_written } => assert_eq!(bytes_written, 6),
            other => panic!("expected Done, got {other:?}"),
        }
        let mut buf = [0u8; 4];
        storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"ABBA");
    }

    #[test]
    fn empty_transaction_is_rejected() {
        let (_dir, storage, journal, table) = setup();
        let ctx = CommitContext {
            storage: &storage,
            journal: &journal,
            lock_table: &table,
            nolock: false,
        };
        let mut t = Transaction::new(TransactionFlags::empty());
        let err = commit(&ctx, &mut t).unwrap_err();
        assert!(matches!(err, CommitError::AtomicPreserved(Error::ProtocolMisuse(_))));
    }

    #[test]
    fn lingering_commit_defers_apply_and_drain_finishes_it() {
        let (_dir, storage, journal, table) = setup();
        let ctx = CommitContext {
            storage: &storage,
            journal: &journal,
            lock_table: &table,
            nolock: false,
        };
        let mut t = Transaction::new(TransactionFlags::empty());
        t.add_op(b"linger", 0).unwrap();

        let (outcome, record) = commit_lingering(&ctx, &mut t).unwrap();
        match outcome {
            CommitOutcome::Lingering { bytes_written, .. } => assert_eq!(bytes_written, 6),
            other => panic!("expected Lingering, got {other:?}"),
        }
        // Not yet applied to the data file.
        let mut buf = [0u8; 6];
        let n = storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 0);
        assert!(!journal.is_empty_of_records().unwrap());

        drain_lingering(&journal, &storage, record).unwrap();
        let n = storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"linger");
        assert!(journal.is_empty_of_records().unwrap());
    }
}
