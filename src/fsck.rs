//! Recovery / `fsck` (C7, §4.7): on demand, classifies every surviving journal record and
//! either finishes it (re-applies a committed record) or discards it (in-progress or bad).
//!
//! Runs standalone given a data-file path and journal directory, or implicitly from
//! [`crate::handle::Handle::open`] unless the handle is read-only.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{CorruptKind, Error, NotFoundKind, Result};
use crate::journal_dir::JournalDir;
use crate::record::{self, ParsedRecord, RecordClass};
use crate::storage::StorageAdapter;

/// Per-class totals returned by a recovery pass (§6's `fsck` `result-out`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Every record file found in the journal directory.
    pub total: usize,
    /// Committed records re-applied to the data file.
    pub reapplied: usize,
    /// Committed records whose re-apply failed (record left in place for the next pass).
    pub apply_error: usize,
    /// Valid records with `committed = 0`, discarded.
    pub in_progress: usize,
    /// Structurally well-formed but semantically invalid records, discarded.
    pub invalid: usize,
    /// Truncated or unreadable records, discarded.
    pub broken: usize,
    /// Magic/checksum mismatches, discarded.
    pub corrupt: usize,
}

/// Runs a recovery pass over `data_path`'s journal (`journal_path`, or the default sibling
/// directory), re-applying committed-but-not-cleaned records and discarding the rest.
///
/// Idempotent per invariant 3: running this twice in a row on an already-clean state returns
/// the same (empty) totals, and re-applying an already-applied committed record is safe
/// because its new-bytes at their offsets are identical on every replay.
pub fn recover(data_path: &Path, journal_path: Option<&Path>) -> Result<RecoveryOutcome> {
    if !data_path.exists() {
        return Err(Error::NotFound(NotFoundKind::NoSuchFile));
    }

    let jpath: PathBuf = match journal_path {
        Some(p) => p.to_path_buf(),
        None => JournalDir::default_path_for(data_path),
    };
    if !jpath.is_dir() || !jpath.join("_counter").exists() {
        return Err(Error::NotFound(NotFoundKind::NoJournal));
    }

    let journal = JournalDir::init(&jpath)?;
    let data_file = OpenOptions::new().read(true).write(true).open(data_path)?;
    let storage = StorageAdapter::new(data_file);

    let mut outcome = RecoveryOutcome::default();
    for id in journal.list_surviving_ids()? {
        outcome.total += 1;
        let path = journal.path_for(id);
        let class = match record::read_and_classify(&path) {
            Ok(c) => c,
            Err(_) => RecordClass::Bad(CorruptKind::Broken),
        };
        classify_one(&journal, &storage, id, class, &mut outcome)?;
    }

    debug!(
        "recovery: total={} reapplied={} apply_error={} in_progress={} invalid={} broken={} corrupt={}",
        outcome.total,
        outcome.reapplied,
        outcome.apply_error,
        outcome.in_progress,
        outcome.invalid,
        outcome.broken,
        outcome.corrupt,
    );
    Ok(outcome)
}

fn classify_one(
    journal: &JournalDir,
    storage: &StorageAdapter,
    id: u32,
    class: RecordClass,
    outcome: &mut RecoveryOutcome,
) -> Result<()> {
    match class {
        RecordClass::Committed(rec) => match reapply(journal, storage, &rec) {
            Ok(()) => outcome.reapplied += 1,
            Err(e) => {
                warn!("recovery: record {id} failed to re-apply: {e}");
                outcome.apply_error += 1;
            }
        },
        RecordClass::InProgress => {
            outcome.in_progress += 1;
            journal.unlink(id)?;
        }
        RecordClass::Bad(CorruptKind::Invalid) => {
            outcome.invalid += 1;
            journal.unlink(id)?;
        }
        RecordClass::Bad(CorruptKind::Broken) => {
            outcome.broken += 1;
            journal.unlink(id)?;
        }
        RecordClass::Bad(CorruptKind::Corrupt) => {
            outcome.corrupt += 1;
            journal.unlink(id)?;
        }
    }
    Ok(())
}

fn reapply(journal: &JournalDir, storage: &StorageAdapter, rec: &ParsedRecord) -> Result<()> {
    for op in &rec.ops {
        storage.write_at(&op.new_bytes, op.offset)?;
    }
    crate::commit::sync_written_extents(storage, &rec.ops)?;
    journal.unlink(rec.trans_id)?;
    Ok(())
}
