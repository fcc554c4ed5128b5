//! Crate-wide error type.
//!
//! Mirrors the distinction the commit engine must preserve at the API boundary:
//! a caller needs to tell "transaction failed, disk unchanged" apart from
//! "transaction failed, disk state unclear, run recovery" (see [`CommitOutcome`](crate::commit::CommitOutcome)),
//! and recovery needs to tell a torn write apart from a structurally broken one.

use std::fmt;
use std::io;

/// The three ways record parsing fails, per the codec's validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    /// Truncated or unreadable: the file is shorter than the fixed header, or a read failed.
    Broken,
    /// Magic or checksum mismatch.
    Corrupt,
    /// Structurally well-formed but semantically invalid (e.g. `num_ops == 0`).
    Invalid,
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptKind::Broken => write!(f, "broken (truncated or unreadable) record"),
            CorruptKind::Corrupt => write!(f, "corrupt record (magic or checksum mismatch)"),
            CorruptKind::Invalid => write!(f, "invalid record (semantic violation)"),
        }
    }
}

/// Reasons recovery cannot even begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    /// The data file does not exist.
    NoSuchFile,
    /// The journal directory is missing or empty.
    NoJournal,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundKind::NoSuchFile => write!(f, "no such file"),
            NotFoundKind::NoJournal => write!(f, "no journal"),
        }
    }
}

/// Errors surfaced by the journaled-commit engine.
#[derive(Debug)]
pub enum Error {
    /// An underlying read/write/sync/lock syscall returned an error.
    Io(io::Error),
    /// A journal record failed codec validation.
    Corrupt(CorruptKind),
    /// An operation was requested on a handle or transaction in the wrong state
    /// (commit after free, autosync started twice, rollback of a `norollback` transaction).
    ProtocolMisuse(&'static str),
    /// Recovery or fsck was asked to operate on something that isn't there.
    NotFound(NotFoundKind),
    /// Allocation, descriptor, or lock exhaustion at open time.
    ResourceExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O failure: {err}"),
            Error::Corrupt(kind) => write!(f, "{kind}"),
            Error::ProtocolMisuse(msg) => write!(f, "protocol misuse: {msg}"),
            Error::NotFound(kind) => write!(f, "{kind}"),
            Error::ResourceExhausted => write!(f, "resource exhaustion"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(io::Error::from_raw_os_error(err as i32))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
