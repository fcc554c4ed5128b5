//! File handle (C9, §4.9/§3 "File handle (F)"): binds an open data file to its journal
//! directory, ID allocator, lock manager, and lingering queue. The root object every public
//! mutating operation goes through.

use std::fs::{self, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Weak;

use bitflags::bitflags;
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::autosync::{Autosync, AutosyncConfig};
use crate::commit::{self, CommitContext, CommitError, CommitOutcome, LingeringRecord};
use crate::error::{Error, Result};
use crate::fsck::{self, RecoveryOutcome};
use crate::journal_dir::JournalDir;
use crate::lock_manager::ProcessLockTable;
use crate::rollback;
use crate::storage::StorageAdapter;
use crate::transaction::{Transaction, TransactionFlags};

bitflags! {
    /// Per-handle flags (§3 "File handle (F)").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandleFlags: u32 {
        /// Skip range locking on every commit; the caller accepts responsibility for
        /// serializing concurrent writers itself (§4.4).
        const NOLOCK = 1 << 0;
        /// Do not stage pre-images for transactions committed under this handle; they
        /// cannot later be rolled back (§4.6).
        const NOROLLBACK = 1 << 1;
        /// Defer data-file apply past `DURABLE_JOURNAL`; a `sync` call or autosync drains
        /// the lingering queue later (§4.5).
        const LINGER = 1 << 2;
        /// Reject mutating calls and skip recovery on open.
        const READONLY = 1 << 3;
    }
}

/// Outcome of `transaction_commit`/`transaction_rollback` translated to the handle's return
/// discipline (§4.5/§6): how many bytes, or which of the two failure classes.
pub type TxResult = std::result::Result<CommitOutcome, CommitError>;

/// Binds a data file descriptor to its journal directory, in-process lock table, and pending
/// linger queue (§3 "File handle (F)").
pub struct Handle {
    storage: StorageAdapter,
    journal: Mutex<JournalDir>,
    lock_table: Arc<ProcessLockTable>,
    flags: HandleFlags,
    lingering: Mutex<Vec<LingeringRecord>>,
    autosync: Mutex<Option<Autosync>>,
}

impl Handle {
    /// Opens (creating if absent, per `open_options`) the data file at `path`, creates the
    /// journal directory if it doesn't exist (default: a hidden sibling directory derived
    /// from `path`'s basename), runs recovery unless `flags` contains `READONLY`, and returns
    /// the handle (§4.9).
    pub fn open(
        path: &Path,
        open_options: &OpenOptions,
        journal_path: Option<&Path>,
        flags: HandleFlags,
    ) -> Result<Arc<Handle>> {
        let readonly = flags.contains(HandleFlags::READONLY);
        let jpath = journal_path
            .map(PathBuf::from)
            .unwrap_or_else(|| JournalDir::default_path_for(path));

        if !readonly {
            let existing_journal = jpath.is_dir() && jpath.join("_counter").exists();
            if existing_journal && path.exists() {
                match fsck::recover(path, Some(&jpath)) {
                    Ok(outcome) => {
                        if outcome.total > 0 {
                            debug!(
                                "open: recovered {} record(s) ({} reapplied)",
                                outcome.total, outcome.reapplied
                            );
                        }
                    }
                    Err(e) => warn!("open: implicit recovery failed: {e}"),
                }
            }
        }

        let file = open_options.open(path)?;
        let storage = StorageAdapter::new(file);
        let journal = JournalDir::init(&jpath)?;

        Ok(Arc::new(Handle {
            storage,
            journal: Mutex::new(journal),
            lock_table: ProcessLockTable::new(),
            flags,
            lingering: Mutex::new(Vec::new()),
            autosync: Mutex::new(None),
        }))
    }

    /// Current pending byte total across every lingering transaction, used by autosync's
    /// byte-threshold check.
    pub fn pending_bytes(&self) -> u64 {
        self.lingering.lock().iter().map(LingeringRecord::bytes).sum()
    }

    /// Allocates an empty transaction. `NOROLLBACK` is forced on if the handle itself has
    /// `NOROLLBACK` set; otherwise the caller may still opt a single transaction in.
    pub fn transaction_new(&self, extra_flags: TransactionFlags) -> Transaction {
        let mut flags = extra_flags;
        if self.flags.contains(HandleFlags::NOROLLBACK) {
            flags |= TransactionFlags::NOROLLBACK;
        }
        Transaction::new(flags)
    }

    fn commit_ctx<'a>(&'a self, journal: &'a JournalDir) -> CommitContext<'a> {
        CommitContext {
            storage: &self.storage,
            journal,
            lock_table: &self.lock_table,
            nolock: self.flags.contains(HandleFlags::NOLOCK),
        }
    }

    /// Runs `t` through the commit state machine. Eager handles run `NEW` to `DONE` in this
    /// call; `LINGER` handles stop at `DURABLE_JOURNAL` and enqueue the record for a later
    /// `sync`/autosync drain (§4.5).
    pub fn transaction_commit(&self, t: &mut Transaction) -> TxResult {
        if self.flags.contains(HandleFlags::READONLY) {
            return Err(CommitError::AtomicPreserved(Error::ProtocolMisuse(
                "transaction_commit on a read-only handle",
            )));
        }
        let journal = self.journal.lock();
        if self.flags.contains(HandleFlags::LINGER) {
            let (outcome, record) = commit::commit_lingering(&self.commit_ctx(&journal), t)?;
            self.lingering.lock().push(record);
            Ok(outcome)
        } else {
            commit::commit(&self.commit_ctx(&journal), t)
        }
    }

    /// Rolls back a `DONE` transaction using its captured pre-images (§4.6). Rejected if `t`
    /// was committed with `NOROLLBACK` set (no pre-images were captured).
    pub fn transaction_rollback(&self, t: &mut Transaction) -> TxResult {
        let ops = t
            .captured_ops()
            .ok_or_else(|| {
                CommitError::AtomicPreserved(Error::ProtocolMisuse(
                    "rollback requested on a transaction with no captured pre-images",
                ))
            })?
            .to_vec();
        let trans_id = t.id().ok_or_else(|| {
            CommitError::AtomicPreserved(Error::ProtocolMisuse("rollback of an uncommitted transaction"))
        })?;
        let record = crate::record::ParsedRecord {
            trans_id,
            flags: crate::record::RecordFlags::COMMITTED,
            ops,
        };
        let journal = self.journal.lock();
        rollback::rollback(&self.commit_ctx(&journal), &record)
    }

    /// Drains every lingering transaction from `DURABLE_JOURNAL` to `DONE`, returning the
    /// total bytes applied.
    pub fn sync(&self) -> Result<u64> {
        let pending: Vec<LingeringRecord> = std::mem::take(&mut *self.lingering.lock());
        let journal = self.journal.lock();
        let mut total = 0u64;
        for record in pending {
            total += commit::drain_lingering(&journal, &self.storage, record)?;
        }
        Ok(total)
    }

    /// Starts the background autosync task. Only one may run per handle at a time; starting
    /// a second one is a protocol-misuse error (§4.8).
    pub fn autosync_start(self: &Arc<Self>, max_seconds: u64, max_bytes: u64) -> Result<()> {
        let mut guard = self.autosync.lock();
        if guard.is_some() {
            return Err(Error::ProtocolMisuse("autosync already running on this handle"));
        }
        let weak: Weak<Handle> = Arc::downgrade(self);
        let pending_weak = weak.clone();
        let pending_bytes = move || pending_weak.upgrade().map(|h| h.pending_bytes()).unwrap_or(0);
        let flush_weak = weak;
        let flush = move || {
            if let Some(h) = flush_weak.upgrade() {
                if let Err(e) = h.sync() {
                    warn!("autosync: sync failed: {e}");
                }
            }
        };
        *guard = Some(Autosync::start(
            AutosyncConfig { max_seconds, max_bytes },
            pending_bytes,
            flush,
        ));
        Ok(())
    }

    /// Stops the autosync task and joins it before returning. An error if none is running.
    pub fn autosync_stop(&self) -> Result<()> {
        match self.autosync.lock().take() {
            Some(a) => {
                a.stop();
                Ok(())
            }
            None => Err(Error::ProtocolMisuse("autosync not running on this handle")),
        }
    }

    /// Flushes lingering records and stops autosync if running. Idempotent.
    pub fn close(&self) -> Result<()> {
        if let Some(a) = self.autosync.lock().take() {
            a.stop();
        }
        self.sync()?;
        Ok(())
    }

    /// Relocates the journal directory to `new_path`. The handle must be quiesced: no
    /// lingering records pending and autosync stopped (§4.9).
    pub fn move_journal(&self, new_path: &Path) -> Result<()> {
        if !self.lingering.lock().is_empty() {
            return Err(Error::ProtocolMisuse(
                "move_journal requires a quiesced handle (drain pending lingering records first)",
            ));
        }
        if self.autosync.lock().is_some() {
            return Err(Error::ProtocolMisuse("move_journal requires autosync to be stopped first"));
        }

        let mut journal = self.journal.lock();
        let old_path = journal.path().to_path_buf();
        let new_journal = JournalDir::init(new_path)?;
        for id in journal.list_surviving_ids()? {
            fs::rename(journal.path_for(id), new_journal.path_for(id))?;
        }
        crate::storage::sync_dir(new_path)?;
        *journal = new_journal;
        drop(journal);
        fs::remove_dir_all(&old_path)?;
        Ok(())
    }

    /// Runs a standalone recovery pass without going through an open handle (§6 `fsck`).
    pub fn fsck(path: &Path, journal_path: Option<&Path>) -> Result<RecoveryOutcome> {
        fsck::recover(path, journal_path)
    }

    /// Raw fd of the open data file, exposed for advisory locking by cooperating callers.
    pub fn data_fd(&self) -> i32 {
        self.storage.as_fd().as_raw_fd()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(a) = self.autosync.lock().take() {
            a.stop();
        }
        if let Err(e) = self.sync() {
            error!("handle dropped with unflushed lingering transactions: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_handle(dir: &Path, flags: HandleFlags) -> Arc<Handle> {
        let data_path = dir.join("data");
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        Handle::open(&data_path, &opts, None, flags).unwrap()
    }

    #[test]
    fn single_write_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let handle = open_handle(dir.path(), HandleFlags::empty());
        let mut t = handle.transaction_new(TransactionFlags::empty());
        t.add_op(b"hello", 0).unwrap();
        match handle.transaction_commit(&mut t).unwrap() {
            CommitOutcome::Done { bytes_written } => assert_eq!(bytes_written, 5),
            other => panic!("expected Done, got {other:?}"),
        }
        handle.close().unwrap();
    }

    #[test]
    fn rollback_round_trip_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = open_handle(dir.path(), HandleFlags::empty());

        let mut seed = handle.transaction_new(TransactionFlags::empty());
        seed.add_op(b"XXXXX", 0).unwrap();
        handle.transaction_commit(&mut seed).unwrap();

        let mut t = handle.transaction_new(TransactionFlags::empty());
        t.add_op(b"YYYYY", 0).unwrap();
        handle.transaction_commit(&mut t).unwrap();

        handle.transaction_rollback(&mut t).unwrap();

        let mut buf = [0u8; 5];
        handle.storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"XXXXX");
    }

    #[test]
    fn linger_mode_defers_apply_until_sync() {
        let dir = tempfile::tempdir().unwrap();
        let handle = open_handle(dir.path(), HandleFlags::LINGER);
        let mut t = handle.transaction_new(TransactionFlags::empty());
        t.add_op(b"later", 0).unwrap();
        match handle.transaction_commit(&mut t).unwrap() {
            CommitOutcome::Lingering { bytes_written, .. } => assert_eq!(bytes_written, 5),
            other => panic!("expected Lingering, got {other:?}"),
        }
        let mut buf = [0u8; 5];
        let n = handle.storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 0);

        let flushed = handle.sync().unwrap();
        assert_eq!(flushed, 5);
        let n = handle.storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn second_open_of_same_journal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _first = open_handle(dir.path(), HandleFlags::empty());
        let data_path = dir.path().join("data");
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        let err = Handle::open(&data_path, &opts, None, HandleFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::ProtocolMisuse(_)) || matches!(err, Error::Io(_)));
    }

    #[test]
    fn autosync_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handle = open_handle(dir.path(), HandleFlags::LINGER);
        handle.autosync_start(3600, 0).unwrap();
        let err = handle.autosync_start(3600, 0).unwrap_err();
        assert!(matches!(err, Error::ProtocolMisuse(_)));
        handle.autosync_stop().unwrap();
    }

    #[test]
    fn readonly_handle_rejects_commit() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data");
        std::fs::write(&data_path, b"").unwrap();
        let mut opts = OpenOptions::new();
        opts.read(true);
        let handle = Handle::open(&data_path, &opts, None, HandleFlags::READONLY).unwrap();

        let mut t = handle.transaction_new(TransactionFlags::empty());
        t.add_op(b"nope", 0).unwrap();
        let err = handle.transaction_commit(&mut t).unwrap_err();
        assert!(matches!(err, CommitError::AtomicPreserved(Error::ProtocolMisuse(_))));
    }

    #[test]
    fn move_journal_relocates_and_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let handle = open_handle(dir.path(), HandleFlags::empty());
        let mut t = handle.transaction_new(TransactionFlags::empty());
        t.add_op(b"abc", 0).unwrap();
        handle.transaction_commit(&mut t).unwrap();

        let new_journal = dir.path().join("relocated.jio");
        handle.move_journal(&new_journal).unwrap();
        assert!(new_journal.join("_counter").exists());
    }
}
