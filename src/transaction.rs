//! A staged, not-yet-committed edit (§3 "Transaction (T)").

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::record::RecordOp;

bitflags! {
    /// Per-transaction flags (a subset of the handle's flags can be overridden per transaction;
    /// currently only `NOROLLBACK` is settable independently of the handle, matching the
    /// rollback engine's own `norollback`-asserted replay per §4.6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        /// Do not capture pre-images for this transaction; it cannot later be rolled back.
        const NOROLLBACK = 1 << 0;
    }
}

/// One `(buffer, length, offset)` write, as staged on a transaction. Later operations in the
/// same transaction override earlier ones on overlapping ranges (§3 "Overlap policy").
#[derive(Debug, Clone)]
pub struct Operation {
    pub buffer: Vec<u8>,
    pub offset: u64,
}

impl Operation {
    pub fn length(&self) -> u64 {
        self.buffer.len() as u64
    }
}

/// The commit state machine's position (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Just allocated, no operations staged yet.
    New,
    /// At least one operation staged via [`Transaction::add_op`].
    Staged,
    /// Range locks acquired for this commit.
    Locked,
    /// Journal record body (header + ops + trailer) written and `fdatasync`'d, `committed = 0`.
    Journaled,
    /// The `COMMITTED` bit is durable — the atomic-commit point.
    DurableJournal,
    /// New bytes written to the data file.
    Applied,
    /// The data-file write is `fdatasync`'d durable.
    DataDurable,
    /// The journal record has been unlinked; the transaction is finished.
    Done,
}

/// A staged, single-owner, not-yet-committed edit. Grown by [`Transaction::add_op`], consumed
/// by the commit engine.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) flags: TransactionFlags,
    pub(crate) ops: Vec<Operation>,
    pub(crate) state: TransactionState,
    /// Assigned once the transaction reaches `Locked`/`Journaled`.
    pub(crate) id: Option<u32>,
    /// Filled in by the commit engine once staged: the same `RecordOp`s written to the
    /// journal, pre-images included when captured. Lets [`crate::handle::Handle::rollback`]
    /// reverse a `DONE` transaction even though its own record file is already unlinked
    /// (§4.6 "whose record may already be unlinked").
    pub(crate) captured: Option<Vec<RecordOp>>,
}

impl Transaction {
    pub fn new(flags: TransactionFlags) -> Self {
        Transaction {
            flags,
            ops: Vec::new(),
            state: TransactionState::New,
            id: None,
            captured: None,
        }
    }

    /// The transaction's assigned journal ID, once staged.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// The staged ops with their pre-images, once committed. `None` before commit or when
    /// `NOROLLBACK` was set.
    pub fn captured_ops(&self) -> Option<&[RecordOp]> {
        self.captured.as_deref()
    }

    /// Appends one operation. The buffer is copied, per §6's `transaction_add` contract.
    pub fn add_op(&mut self, buffer: &[u8], offset: u64) -> Result<()> {
        if matches!(self.state, TransactionState::Done) {
            return Err(Error::ProtocolMisuse("add_op on a freed/done transaction"));
        }
        if buffer.is_empty() {
            return Err(Error::ProtocolMisuse("zero-length operation rejected"));
        }
        self.ops.push(Operation {
            buffer: buffer.to_vec(),
            offset,
        });
        self.state = TransactionState::Staged;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Aggregate byte count across every staged operation (§3).
    pub fn total_bytes(&self) -> u64 {
        self.ops.iter().map(Operation::length).sum()
    }

    pub fn norollback(&self) -> bool {
        self.flags.contains(TransactionFlags::NOROLLBACK)
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_operation_is_rejected() {
        let mut t = Transaction::new(TransactionFlags::empty());
        let err = t.add_op(&[], 0).unwrap_err();
        assert!(matches!(err, Error::ProtocolMisuse(_)));
    }

    #[test]
    fn total_bytes_sums_all_ops() {
        let mut t = Transaction::new(TransactionFlags::empty());
        t.add_op(b"AAAA", 0).unwrap();
        t.add_op(b"BB", 1).unwrap();
        assert_eq!(t.total_bytes(), 6);
    }

    #[test]
    fn fresh_transaction_has_no_captured_ops() {
        let t = Transaction::new(TransactionFlags::empty());
        assert!(t.captured_ops().is_none());
    }
}
