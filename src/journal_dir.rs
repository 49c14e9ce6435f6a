//! Journal directory manager (C1): names, creates, enumerates, and
//! garbage-collects the per-file journal directory (spec §4.3, §6).
//!
//! Layout, relative to the directory root:
//!
//! - `lock`    — zero-byte file used to hold the directory's advisory lock.
//! - `counter` — 8-byte little-endian `u64`, the next transaction id to
//!   allocate, read-modify-written under the directory lock.
//! - `NNNNNNNN` — one file per transaction, name = zero-padded decimal id
//!   (see [`RECORD_NAME_WIDTH`]).
//!
//! `JournalDir` holds the directory lock for its entire lifetime, the same
//! way the teacher's `Ledger::load_or_create` holds `buffer.lock` for the
//! life of the `Ledger` — this is what makes a second concurrent `open` on
//! the same journal directory fail fast with [`OpenError::JournalDirBusy`]
//! instead of silently corrupting the sequence counter, and it also means
//! the "acquire the directory lock for id allocation" sub-step of spec
//! §4.4 is already satisfied for the handle's entire lifetime: only one
//! handle (hence one lock holder, in any cooperating process) can be
//! mutating the counter at a time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fslock::LockFile;
use snafu::ResultExt;
use tracing::{debug, instrument, warn};

use crate::error::{
    CreateJournalDirSnafu, LockJournalDirSnafu, OpenError, ReadCounterSnafu,
};

pub const RECORD_NAME_WIDTH: usize = 8;
const LOCK_FILE_NAME: &str = "lock";
const COUNTER_FILE_NAME: &str = "counter";
const FIRST_TRANS_ID: u64 = 1;

/// The per-data-file journal directory (C1).
pub struct JournalDir {
    path: PathBuf,
    lock: LockFile,
    next_id: AtomicU64,
}

impl JournalDir {
    /// Default journal directory for a data file: a hidden sibling
    /// directory named from the data file's base name (spec §6).
    pub fn default_path_for(data_file: &Path) -> PathBuf {
        let parent = data_file.parent().unwrap_or_else(|| Path::new("."));
        let file_name = data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parent.join(format!(".{file_name}.jio"))
    }

    /// Creates the journal directory if it doesn't exist (mode 0700) and
    /// takes exclusive ownership of it for the caller's handle.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn create_or_open(path: &Path) -> Result<Self, OpenError> {
        if !path.exists() {
            fs::create_dir_all(path).context(CreateJournalDirSnafu { path })?;
            set_private_mode(path).context(CreateJournalDirSnafu { path })?;
            debug!("created journal directory");
        }

        let lock_path = path.join(LOCK_FILE_NAME);
        let mut lock = LockFile::open(&lock_path).context(LockJournalDirSnafu { path })?;
        if !lock.try_lock().context(LockJournalDirSnafu { path })? {
            warn!("journal directory already locked by another handle");
            return Err(OpenError::JournalDirBusy {
                path: path.to_path_buf(),
            });
        }

        let next_id = read_or_init_counter(path).context(ReadCounterSnafu { path })?;

        Ok(JournalDir {
            path: path.to_path_buf(),
            lock,
            next_id: AtomicU64::new(next_id),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a fresh, durable transaction id (spec §4.4 step 1).
    ///
    /// The counter file is rewritten before the id is handed back, so a
    /// crash right after this call still leaves the *next* open seeing an
    /// id at least as large as any id a caller could have observed.
    pub fn allocate_id(&self) -> io::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        write_counter(&self.path, id + 1)?;
        Ok(id)
    }

    pub fn record_path(&self, id: u64) -> PathBuf {
        self.path.join(format!("{id:0width$}", width = RECORD_NAME_WIDTH))
    }

    /// Lists every transaction record currently in the directory, sorted
    /// by id. Used by the checker (C7) and by `move_journal`.
    pub fn enumerate_records(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        enumerate_records(&self.path)
    }

    /// Unlinks a retired record, then fsyncs the directory itself so the
    /// unlink is durable — `sync_all` on the record file only covers the
    /// file's own data, not the directory entry that named it (spec §4.4
    /// step 8 "retire record").
    pub fn remove_record(&self, id: u64) -> io::Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => sync_dir(&self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fsyncs the journal directory itself. POSIX does not make a file's
    /// directory entry durable just because the file's own `sync_all`
    /// succeeded — creating (or unlinking) `NNNNNNNN` needs the directory
    /// inode flushed too, or a crash right after can leave the entry
    /// missing even though the record's bytes made it to disk (spec §8
    /// invariant 3). Called after a record file is created and after its
    /// commit mark is patched in (spec §4.4 steps 4–5), in addition to
    /// `remove_record`'s own call after step 8.
    pub fn sync(&self) -> io::Result<()> {
        sync_dir(&self.path)
    }

    /// Relocates the journal directory to `new_path` (spec §4.3
    /// `jmove_journal`): acquire the lock (already held for our lifetime),
    /// create the destination, hard-link every entry across, flip this
    /// handle's in-memory pointer, then unlink the source entries.
    pub fn move_to(&mut self, new_path: &Path) -> Result<(), crate::error::MoveJournalError> {
        use crate::error::IoSnafu;

        if new_path.exists() {
            let has_entries = fs::read_dir(new_path)
                .context(IoSnafu)?
                .next()
                .is_some();
            if has_entries {
                return Err(crate::error::MoveJournalError::DestinationNotEmpty {
                    path: new_path.to_path_buf(),
                });
            }
        } else {
            fs::create_dir_all(new_path).context(IoSnafu)?;
            set_private_mode(new_path).context(IoSnafu)?;
        }

        let records = enumerate_records(&self.path).context(IoSnafu)?;
        for (id, src) in &records {
            let dst = new_path.join(format!("{id:0width$}", width = RECORD_NAME_WIDTH));
            fs::hard_link(src, &dst).or_else(|_| fs::copy(src, &dst).map(|_| ()))
                .context(IoSnafu)?;
        }
        write_counter(new_path, self.next_id.load(Ordering::SeqCst)).context(IoSnafu)?;

        let old_path = std::mem::replace(&mut self.path, new_path.to_path_buf());
        for (id, _) in &records {
            let _ = fs::remove_file(old_path.join(format!("{id:0width$}", width = RECORD_NAME_WIDTH)));
        }
        let _ = fs::remove_file(old_path.join(COUNTER_FILE_NAME));
        let _ = fs::remove_file(old_path.join(LOCK_FILE_NAME));
        let _ = fs::remove_dir(&old_path);

        Ok(())
    }

    /// Unlinks every remaining entry and the directory itself. Intended
    /// as the terminal step of a successful `jfsck` run (spec §4.5).
    pub fn cleanup(&self) -> io::Result<()> {
        for (id, _) in self.enumerate_records()? {
            self.remove_record(id)?;
        }
        let _ = fs::remove_file(self.path.join(COUNTER_FILE_NAME));
        Ok(())
    }
}

/// Standalone enumeration helper used both by a live [`JournalDir`] and by
/// the checker when it opens a journal directory cold (no live handle).
pub fn enumerate_records(path: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut records = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == LOCK_FILE_NAME || name == COUNTER_FILE_NAME {
            continue;
        }
        if let Ok(id) = name.parse::<u64>() {
            records.push((id, entry.path()));
        }
    }
    records.sort_by_key(|(id, _)| *id);
    Ok(records)
}

fn read_or_init_counter(dir: &Path) -> io::Result<u64> {
    let path = dir.join(COUNTER_FILE_NAME);
    match File::open(&path) {
        Ok(mut f) => {
            let mut buf = [0u8; 8];
            match f.read_exact(&mut buf) {
                Ok(()) => Ok(u64::from_le_bytes(buf)),
                Err(_) => {
                    write_counter(dir, FIRST_TRANS_ID)?;
                    Ok(FIRST_TRANS_ID)
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            write_counter(dir, FIRST_TRANS_ID)?;
            Ok(FIRST_TRANS_ID)
        }
        Err(e) => Err(e),
    }
}

fn write_counter(dir: &Path, next: u64) -> io::Result<()> {
    let path = dir.join(COUNTER_FILE_NAME);
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    f.write_all(&next.to_le_bytes())?;
    f.sync_all()
}

#[cfg(unix)]
fn set_private_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_private_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
