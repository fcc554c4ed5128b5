//! The sibling directory holding one file per live transaction plus the ID counter (§4.2).

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::debug;
use parking_lot::Mutex;

use crate::error::{CorruptKind, Error, Result};
use crate::storage;

const COUNTER_FILE_NAME: &str = "_counter";
const LOCK_FILE_NAME: &str = "_lock";
const COUNTER_WIDTH: usize = 8;

/// `fcntl` record locks are scoped to `(process, inode)`: a second `init` on the same journal
/// directory from the *same* process would not conflict with the first at the kernel level, so
/// the open-process-wide set of canonical journal paths currently held backstops it. This is
/// the one piece of process-global state in the crate; it exists solely to make "concurrent
/// open of the same handle fails with a lock error" (§8) hold within one process as well as
/// across processes, where the `fcntl` lock alone already suffices.
fn open_journals() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN_JOURNALS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN_JOURNALS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Owns the journal directory's lifetime for one open handle: the counter file, the
/// directory-level session lock, and record path materialization.
#[derive(Debug)]
pub struct JournalDir {
    path: PathBuf,
    canonical_path: PathBuf,
    counter: Mutex<File>,
    /// Held exclusively for the handle's lifetime; rejects a second concurrent open.
    _session_lock: File,
}

impl JournalDir {
    /// Default sibling directory for a data file at `data_path`: `.<basename>.jio/`.
    pub fn default_path_for(data_path: &Path) -> PathBuf {
        let parent = data_path.parent().unwrap_or_else(|| Path::new("."));
        let name = data_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parent.join(format!(".{name}.jio"))
    }

    /// Creates the directory and counter file if missing, then takes the exclusive session
    /// lock. Returns a protocol-misuse error if another handle already holds it.
    pub fn init(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let canonical_path = fs::canonicalize(path)?;
        {
            let mut open = open_journals().lock();
            if !open.insert(canonical_path.clone()) {
                return Err(Error::ProtocolMisuse(
                    "journal directory already held by another open handle in this process",
                ));
            }
        }

        match Self::init_locked(path, canonical_path.clone()) {
            Ok(jdir) => Ok(jdir),
            Err(e) => {
                open_journals().lock().remove(&canonical_path);
                Err(e)
            }
        }
    }

    fn init_locked(path: &Path, canonical_path: PathBuf) -> Result<Self> {
        let counter_path = path.join(COUNTER_FILE_NAME);
        let counter_exists = counter_path.exists();
        let has_records = fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .any(|e| is_record_name(&e.file_name().to_string_lossy()));
        if !counter_exists && has_records {
            // §9 open question: refuse to guess the next ID rather than risk reusing one.
            return Err(Error::Corrupt(CorruptKind::Invalid));
        }

        let mut counter = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&counter_path)?;
        if counter.metadata()?.len() == 0 {
            use std::io::Write;
            counter.write_all(&[b'0'; COUNTER_WIDTH])?;
            storage::sync_dir(path)?;
        }

        let lock_path = path.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        storage::lock_range(lock_file.as_fd().as_raw_fd(), 0, 0, false).map_err(|_| {
            Error::ProtocolMisuse("journal directory already held by another open handle")
        })?;

        debug!("journal directory initialized at {}", path.display());
        Ok(JournalDir {
            path: path.to_path_buf(),
            canonical_path,
            counter: Mutex::new(counter),
            _session_lock: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically allocates and persists the next transaction ID.
    pub fn next_id(&self) -> Result<u32> {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut counter = self.counter.lock();
        storage::lock_range(counter.as_fd().as_raw_fd(), 0, 0, true)?;

        let mut buf = [0u8; COUNTER_WIDTH];
        counter.seek(SeekFrom::Start(0))?;
        counter.read_exact(&mut buf)?;
        let text = std::str::from_utf8(&buf).map_err(|_| Error::Corrupt(CorruptKind::Invalid))?;
        let current: u64 = text
            .trim()
            .parse()
            .map_err(|_| Error::Corrupt(CorruptKind::Invalid))?;
        let next = current
            .checked_add(1)
            .ok_or(Error::ResourceExhausted)?;

        let text = format!("{next:0width$}", width = COUNTER_WIDTH);
        counter.seek(SeekFrom::Start(0))?;
        counter.write_all(text.as_bytes())?;
        counter.flush()?;
        nix::unistd::fdatasync(counter.as_fd())?;

        storage::unlock_range(counter.as_fd().as_raw_fd(), 0, 0)?;
        Ok(next as u32)
    }

    /// Path for the record file with the given transaction ID.
    pub fn path_for(&self, id: u32) -> PathBuf {
        self.path.join(id.to_string())
    }

    /// Every record ID currently present, ascending — survivors to classify at recovery (§4.7).
    pub fn list_surviving_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = fs::read_dir(&self.path)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if is_record_name(&name) {
                    name.parse::<u32>().ok()
                } else {
                    None
                }
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Removes a finished record's file and fsyncs the directory so the unlink is durable.
    pub fn unlink(&self, id: u32) -> Result<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        storage::sync_dir(&self.path)?;
        Ok(())
    }

    /// True when the directory holds nothing but the counter (and lock) file — invariant 5.
    pub fn is_empty_of_records(&self) -> Result<bool> {
        Ok(self.list_surviving_ids()?.is_empty())
    }
}

impl Drop for JournalDir {
    fn drop(&mut self) {
        open_journals().lock().remove(&self.canonical_path);
    }
}

fn is_record_name(name: &str) -> bool {
    name != COUNTER_FILE_NAME && name != LOCK_FILE_NAME && name.chars().all(|c| c.is_ascii_digit()) && !name.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_counter_and_allocates_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let jdir_path = dir.path().join(".data.jio");
        let jdir = JournalDir::init(&jdir_path).unwrap();
        assert_eq!(jdir.next_id().unwrap(), 1);
        assert_eq!(jdir.next_id().unwrap(), 2);
        assert_eq!(jdir.next_id().unwrap(), 3);
    }

    #[test]
    fn list_surviving_ids_ignores_counter_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let jdir_path = dir.path().join(".data.jio");
        let jdir = JournalDir::init(&jdir_path).unwrap();
        File::create(jdir.path_for(1)).unwrap();
        File::create(jdir.path_for(2)).unwrap();
        let mut ids = jdir.list_surviving_ids().unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn unlink_removes_record_and_directory_becomes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let jdir_path = dir.path().join(".data.jio");
        let jdir = JournalDir::init(&jdir_path).unwrap();
        File::create(jdir.path_for(1)).unwrap();
        assert!(!jdir.is_empty_of_records().unwrap());
        jdir.unlink(1).unwrap();
        assert!(jdir.is_empty_of_records().unwrap());
    }

    #[test]
    fn default_path_derives_hidden_sibling_directory() {
        let p = Path::new("/tmp/foo/data.db");
        assert_eq!(JournalDir::default_path_for(p), Path::new("/tmp/foo/.data.db.jio"));
    }
}
