//! On-disk journal record format (§3, §4.3): header, per-operation descriptors, new/old byte
//! runs, and the trailer checksum that distinguishes an in-progress record from a committed one.
//!
//! The header and per-op descriptors are `#[repr(C)]` `zerocopy` structs so they can be read
//! and written as raw bytes without a manual field-by-field codec.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::Path;

use bitflags::bitflags;
use log::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{CorruptKind, Error, Result};

/// Fixed 32-bit constant identifying a journal record file. Stable across a compatible major
/// version (§6).
pub const MAGIC: u32 = 0x4a494f_52; // "JIOR" squeezed into 4 bytes
/// On-disk record format version.
pub const VERSION: u32 = 1;

bitflags! {
    /// Header flag bits (§3). Deliberately excluded from the checksum (see [`checksum`]) so
    /// that flipping `COMMITTED`/`ROLLBACKING`/`ROLLBACKED` in place never invalidates the
    /// trailer written earlier in the same two-phase commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        /// Set only after the body and trailer are durable; the atomic-commit point.
        const COMMITTED   = 1 << 0;
        /// Set on a rollback's own record before that rollback commits.
        const ROLLBACKING = 1 << 1;
        /// Set on a rollback's own record after that rollback commits.
        const ROLLBACKED  = 1 << 2;
    }
}

/// Fixed-size record header, written little-endian (`zerocopy`'s native layout on every
/// platform this crate targets).
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub num_ops: u32,
    pub trans_id: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<RawHeader>();

/// Fixed-size per-operation descriptor preceding that operation's byte runs.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawOpDescriptor {
    pub length: u64,
    pub offset: u64,
}

const OP_DESCRIPTOR_SIZE: usize = std::mem::size_of::<RawOpDescriptor>();
const TRAILER_SIZE: usize = std::mem::size_of::<u32>();

/// One parsed (or about-to-be-written) operation: new bytes, and pre-image bytes if captured.
///
/// `old_len` records the file's length at capture time even when `old_bytes` is shorter than
/// `length` (a short read near EOF, padded per §4.5's pre-image capture rule) so rollback can
/// re-truncate rather than guess.
#[derive(Debug, Clone)]
pub struct RecordOp {
    /// Byte offset into the data file this operation writes at.
    pub offset: u64,
    /// The bytes this operation writes.
    pub new_bytes: Vec<u8>,
    /// `None` when the record was written with `norollback` set.
    pub old_bytes: Option<Vec<u8>>,
    /// File length at the moment the pre-image was captured, valid only when `old_bytes.is_some()`.
    pub old_file_len: u64,
}

impl RecordOp {
    /// Length in bytes of [`RecordOp::new_bytes`].
    pub fn length(&self) -> u64 {
        self.new_bytes.len() as u64
    }
}

/// A fully parsed, in-memory record, ready to be replayed or inspected.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub trans_id: u32,
    pub flags: RecordFlags,
    pub ops: Vec<RecordOp>,
}

impl ParsedRecord {
    pub fn is_committed(&self) -> bool {
        self.flags.contains(RecordFlags::COMMITTED)
    }

    pub fn has_rollback_data(&self) -> bool {
        self.ops.iter().all(|op| op.old_bytes.is_some())
    }
}

/// Classification assigned to a record file surviving on disk, per §4.3/§4.7.
#[derive(Debug, Clone)]
pub enum RecordClass {
    /// Valid, `committed = 1`, checksum matches: must be (re)applied.
    Committed(ParsedRecord),
    /// Valid, `committed = 0`: must be discarded.
    InProgress,
    /// Fails codec validation.
    Bad(CorruptKind),
}

/// A fixed 32-bit rolling checksum over header (excluding the `flags` word) and all operation
/// bytes. Guards against torn writes, not adversaries (§4.3) — no cryptographic strength, no
/// external crc crate.
pub fn checksum(header: &RawHeader, ops: &[RecordOp], include_old: bool) -> u32 {
    let mut sum: u32 = 0;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            sum = sum.rotate_left(1).wrapping_add(b as u32);
        }
    };
    feed(&header.magic.to_le_bytes());
    feed(&header.version.to_le_bytes());
    // header.flags is intentionally skipped: it is the one field mutated in place after the
    // trailer is already durable (committed, then rollbacking/rollbacked on rollback records).
    feed(&header.num_ops.to_le_bytes());
    feed(&header.trans_id.to_le_bytes());
    for op in ops {
        feed(&op.length().to_le_bytes());
        feed(&op.offset.to_le_bytes());
        feed(&op.new_bytes);
        if include_old {
            if let Some(old) = &op.old_bytes {
                feed(old);
            }
        }
    }
    sum
}

/// Writes a brand-new record file in the two-phase sequence required for crash-distinguishable
/// commit: body (header with `committed=0` + every op's new/old bytes + trailer checksum) is
/// written and `fdatasync`'d first; only then is the header rewritten with `committed=1` and
/// `fdatasync`'d again (§4.3).
pub struct RecordWriter {
    file: File,
}

impl RecordWriter {
    /// Creates the record file at `path`, truncating any stale contents.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(RecordWriter { file })
    }

    /// Opens an existing, already-committed record file to flip a header flag bit in place
    /// (the rollback engine's `rollbacking`/`rollbacked` marks, §4.6). Does not touch the body.
    pub fn open_for_update(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(RecordWriter { file })
    }

    /// Writes the full body (header + ops) and the trailer, then `fdatasync`s. The header on
    /// disk after this call still has `committed = 0`.
    pub fn write_body(&mut self, trans_id: u32, ops: &[RecordOp], capture_rollback: bool) -> Result<()> {
        if ops.is_empty() {
            return Err(Error::ProtocolMisuse("transaction has no operations"));
        }
        let header = RawHeader {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            num_ops: ops.len() as u32,
            trans_id,
        };
        self.file.write_all(header.as_bytes())?;
        for op in ops {
            let desc = RawOpDescriptor {
                length: op.length(),
                offset: op.offset,
            };
            self.file.write_all(desc.as_bytes())?;
            self.file.write_all(&op.new_bytes)?;
            if capture_rollback {
                let old = op
                    .old_bytes
                    .as_ref()
                    .expect("capture_rollback requires pre-images to have been captured");
                self.file.write_all(old)?;
            }
        }
        let sum = checksum(&header, ops, capture_rollback);
        self.file.write_all(&sum.to_le_bytes())?;
        self.file.flush()?;
        nix::unistd::fdatasync(self.file.as_fd())?;
        trace!("record {trans_id}: body durable, committed=0");
        Ok(())
    }

    /// Flips the `COMMITTED` bit in place and `fdatasync`s again — the atomic-commit point.
    pub fn mark_committed(&mut self) -> Result<()> {
        self.set_flag_bit(RecordFlags::COMMITTED, true)
    }

    pub fn mark_rollbacking(&mut self) -> Result<()> {
        self.set_flag_bit(RecordFlags::ROLLBACKING, true)
    }

    pub fn mark_rollbacked(&mut self) -> Result<()> {
        self.set_flag_bit(RecordFlags::ROLLBACKED, true)
    }

    fn set_flag_bit(&mut self, bit: RecordFlags, set: bool) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        let mut raw = [0u8; HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut raw)?;
        let mut header =
            RawHeader::read_from_bytes(&raw).map_err(|_| Error::Corrupt(CorruptKind::Broken))?;
        let mut flags = RecordFlags::from_bits_truncate(header.flags);
        flags.set(bit, set);
        header.flags = flags.bits();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(header.as_bytes())?;
        self.file.flush()?;
        nix::unistd::fdatasync(self.file.as_fd())?;
        trace!("record: flags now {flags:?}");
        Ok(())
    }
}

/// Parses and classifies a record file from disk.
pub fn read_and_classify(path: &Path) -> Result<RecordClass> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RecordClass::Bad(CorruptKind::Broken));
        }
        Err(e) => return Err(e.into()),
    };

    let mut raw_header = [0u8; HEADER_SIZE];
    if file.read_exact(&mut raw_header).is_err() {
        return Ok(RecordClass::Bad(CorruptKind::Broken));
    }
    let header = match RawHeader::read_from_bytes(&raw_header) {
        Ok(h) => h,
        Err(_) => return Ok(RecordClass::Bad(CorruptKind::Broken)),
    };
    if header.magic != MAGIC || header.version != VERSION {
        return Ok(RecordClass::Bad(CorruptKind::Corrupt));
    }
    if header.num_ops == 0 {
        return Ok(RecordClass::Bad(CorruptKind::Invalid));
    }

    let flags = RecordFlags::from_bits_truncate(header.flags);
    let committed = flags.contains(RecordFlags::COMMITTED);

    // The body layout is ambiguous (old_bytes present or not) without knowing whether
    // pre-images were captured; we discover that empirically by checking whether the file
    // size is consistent with "no old_bytes" or "old_bytes present" exactly.
    let file_len = match file.metadata() {
        Ok(m) => m.len(),
        Err(_) => return Ok(RecordClass::Bad(CorruptKind::Broken)),
    };

    let mut descriptors = Vec::with_capacity(header.num_ops as usize);
    let mut cursor = HEADER_SIZE as u64;
    for _ in 0..header.num_ops {
        let mut raw_desc = [0u8; OP_DESCRIPTOR_SIZE];
        use std::io::{Seek, SeekFrom};
        if file.seek(SeekFrom::Start(cursor)).is_err() || file.read_exact(&mut raw_desc).is_err() {
            return Ok(RecordClass::Bad(CorruptKind::Broken));
        }
        let desc = match RawOpDescriptor::read_from_bytes(&raw_desc) {
            Ok(d) => d,
            Err(_) => return Ok(RecordClass::Bad(CorruptKind::Broken)),
        };
        if desc.length == 0 {
            return Ok(RecordClass::Bad(CorruptKind::Invalid));
        }
        cursor += OP_DESCRIPTOR_SIZE as u64;
        descriptors.push((desc, cursor));
        cursor += desc.length;
    }

    let without_old = cursor + TRAILER_SIZE as u64;
    let with_old: u64 = without_old
        + descriptors.iter().map(|(d, _)| d.length).sum::<u64>();

    let has_old = if file_len == without_old {
        false
    } else if file_len == with_old {
        true
    } else {
        return Ok(RecordClass::Bad(CorruptKind::Invalid));
    };

    let mut ops = Vec::with_capacity(descriptors.len());
    {
        use std::io::{Seek, SeekFrom};
        let mut pos = HEADER_SIZE as u64;
        for (desc, new_start) in &descriptors {
            let _ = new_start;
            file.seek(SeekFrom::Start(pos + OP_DESCRIPTOR_SIZE as u64))
                .map_err(Error::from)?;
            let mut new_bytes = vec![0u8; desc.length as usize];
            if file.read_exact(&mut new_bytes).is_err() {
                return Ok(RecordClass::Bad(CorruptKind::Broken));
            }
            let old_bytes = if has_old {
                let mut buf = vec![0u8; desc.length as usize];
                if file.read_exact(&mut buf).is_err() {
                    return Ok(RecordClass::Bad(CorruptKind::Broken));
                }
                Some(buf)
            } else {
                None
            };
            pos += OP_DESCRIPTOR_SIZE as u64 + desc.length + if has_old { desc.length } else { 0 };
            ops.push(RecordOp {
                offset: desc.offset,
                new_bytes,
                old_bytes,
                old_file_len: 0,
            });
        }
    }

    let mut trailer_bytes = [0u8; TRAILER_SIZE];
    {
        use std::io::{Seek, SeekFrom};
        if file.seek(SeekFrom::Start(cursor)).is_err() || file.read_exact(&mut trailer_bytes).is_err()
        {
            return Ok(RecordClass::Bad(CorruptKind::Broken));
        }
    }
    let stored_checksum = u32::from_le_bytes(trailer_bytes);
    let computed = checksum(&header, &ops, has_old);
    if stored_checksum != computed {
        return Ok(RecordClass::Bad(CorruptKind::Corrupt));
    }

    if !committed {
        return Ok(RecordClass::InProgress);
    }

    Ok(RecordClass::Committed(ParsedRecord {
        trans_id: header.trans_id,
        flags,
        ops,
    }))
}
