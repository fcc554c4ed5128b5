//! Atomic, durable, multi-region writes to ordinary files via a journaled commit engine.
//!
//! An application that needs "either all of these byte ranges land on disk, or none do,
//! across crashes and concurrent writers" opens a [`Handle`] on a data file, stages a
//! [`Transaction`], and commits it. Every committed transaction is made durable by first
//! writing a two-phase journal record beside the data file (see [`record`] for the on-disk
//! layout), then applying it to the data file itself; a crash between those two steps is
//! resolved by a recovery pass ([`fsck`]) that classifies and finishes or discards every
//! record surviving in the journal directory.
//!
//! This crate does not provide a filesystem, a database, or an allocator. It does not protect
//! against media corruption outside an in-flight write, a filesystem whose `fsync` lies about
//! durability, or a process that writes to the data file without going through a [`Handle`].

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

mod autosync;
mod commit;
mod error;
mod fsck;
mod handle;
mod journal_dir;
mod lock_manager;
mod record;
mod rollback;
mod storage;
mod transaction;

pub use crate::commit::{CommitError, CommitOutcome};
pub use crate::error::{CorruptKind, Error, NotFoundKind, Result};
pub use crate::fsck::RecoveryOutcome;
pub use crate::handle::{Handle, HandleFlags, TxResult};
pub use crate::record::RecordOp;
pub use crate::transaction::{Transaction, TransactionFlags, TransactionState};

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

/// Opens a data file with read/write access, creating it if absent, with the given
/// handle flags (§6 `open`). Equivalent to [`Handle::open`] with an `OpenOptions` of
/// `.read(true).write(true).create(true)` and the default sibling journal directory.
pub fn open(path: impl AsRef<Path>, flags: HandleFlags) -> Result<Arc<Handle>> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(!flags.contains(HandleFlags::READONLY));
    Handle::open(path.as_ref(), &options, None, flags)
}

/// Runs a standalone recovery pass without an open handle (§6 `fsck`). `journal_path`
/// defaults to the hidden sibling directory derived from `path`'s basename.
pub fn fsck(path: impl AsRef<Path>, journal_path: Option<&Path>) -> Result<RecoveryOutcome> {
    fsck::recover(path.as_ref(), journal_path)
}
