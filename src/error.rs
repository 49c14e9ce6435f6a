//! Error types shared across the crate.
//!
//! Every fallible entry point returns a `snafu`-derived enum scoped to its
//! own concern, following the same shape as the teacher's `DataDirError`/
//! `LedgerLoadCreateError`: one variant per distinguishable failure, with a
//! `#[snafu(display(...))]` message and `source` chaining where the failure
//! wraps an underlying `io::Error`.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// Errors that can occur while opening or closing a [`crate::handle::JournaledFile`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OpenError {
    #[snafu(display("failed to open data file {:?}: {}", path, source))]
    DataFile { path: PathBuf, source: io::Error },

    #[snafu(display("failed to create journal directory {:?}: {}", path, source))]
    CreateJournalDir { path: PathBuf, source: io::Error },

    #[snafu(display("failed to lock journal directory {:?}: {}", path, source))]
    LockJournalDir { path: PathBuf, source: io::Error },

    #[snafu(display("journal directory {:?} is already in use by another handle", path))]
    JournalDirBusy { path: PathBuf },

    #[snafu(display("failed to read journal sequence counter in {:?}: {}", path, source))]
    ReadCounter { path: PathBuf, source: io::Error },

    #[snafu(display("unsupported stream open mode {:?}", mode))]
    InvalidMode { mode: String },
}

/// Errors while relocating a journal directory via [`crate::handle::JournaledFile::move_journal`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MoveJournalError {
    #[snafu(display("destination journal directory {:?} already has entries", path))]
    DestinationNotEmpty { path: PathBuf },

    #[snafu(display("I/O error while relocating journal directory: {}", source))]
    Io { source: io::Error },
}

/// Errors acquiring or releasing a byte-range lock on the data file (C2).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    #[snafu(display("failed to acquire range lock [{}, {}): {}", start, end, source))]
    Acquire {
        start: u64,
        end: u64,
        source: nix::Error,
    },

    #[snafu(display("failed to release range lock [{}, {}): {}", start, end, source))]
    Release {
        start: u64,
        end: u64,
        source: nix::Error,
    },
}

/// Errors decoding a journal record from disk (C3).
///
/// These map onto the classification scheme from spec.md §4.2; the checker
/// (C7) uses this type to decide which bucket a record falls into rather
/// than aborting on the first error.
#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("record truncated before header could be read"))]
    TruncatedHeader,

    #[snafu(display("record truncated before operation descriptors could be read"))]
    TruncatedDescriptors,

    #[snafu(display("unsupported record version {} (expected {})", found, expected))]
    UnsupportedVersion { found: u32, expected: u32 },

    #[snafu(display("bad magic value 0x{:08x}", found))]
    BadMagic { found: u32 },

    #[snafu(display(
        "record declares {} bytes of payload/undo data but the file is only {} bytes",
        declared,
        actual
    ))]
    SizeMismatch { declared: u64, actual: u64 },

    #[snafu(display("checksum mismatch: expected 0x{:08x}, computed 0x{:08x}", expected, computed))]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[snafu(display("I/O error reading record: {}", source))]
    ReadIo { source: io::Error },
}

/// Errors committing a transaction (C4), preserving the atomic/severe
/// distinction mandated by spec.md §7: an `Atomic` failure means the data
/// file was never touched; a `Severe` failure means the commit mark is
/// durable but some operations may not yet be applied, and a checker run
/// is required to finish the job.
#[derive(Debug, Snafu)]
pub enum CommitError {
    #[snafu(display("transaction aborted before the commit mark was made durable: {}", source))]
    Atomic { source: CommitFailure },

    #[snafu(display(
        "commit mark for transaction {} is durable but applying it failed after {} of {} operations: {}",
        trans_id,
        applied,
        total,
        source
    ))]
    Severe {
        applied: usize,
        total: usize,
        trans_id: u64,
        source: io::Error,
    },
}

/// The underlying cause of an [`CommitError::Atomic`] failure.
#[derive(Debug, Snafu)]
pub enum CommitFailure {
    #[snafu(display("invalid operation: {}", reason))]
    InvalidOperation { reason: &'static str },

    #[snafu(display("file is read-only"))]
    ReadOnly,

    #[snafu(display(
        "transaction totals {} bytes, exceeding the {} byte max_record_size limit",
        total,
        limit
    ))]
    RecordTooLarge { total: usize, limit: usize },

    #[snafu(display("failed to allocate a transaction id: {}", source))]
    IdAllocation { source: io::Error },

    #[snafu(display("failed to acquire range lock: {}", source))]
    Lock { source: LockError },

    #[snafu(display("failed to capture undo image: {}", source))]
    CaptureUndo { source: io::Error },

    #[snafu(display("failed to write journal record: {}", source))]
    WriteRecord { source: io::Error },
}

/// Errors rolling back a previously committed transaction.
#[derive(Debug, Snafu)]
pub enum RollbackError {
    #[snafu(display("transaction was committed with NOROLLBACK and has no undo images"))]
    NoRollbackInfo,

    #[snafu(display("transaction was not committed; nothing to roll back"))]
    NotCommitted,

    #[snafu(display("{}", source))]
    Commit { source: CommitError },
}

/// Errors from the checker / recovery tool (C7).
#[derive(Debug, Snafu)]
pub enum CheckError {
    #[snafu(display("no such data file: {:?}", path))]
    NoSuchFile { path: PathBuf },

    #[snafu(display("no journal directory at {:?}", path))]
    NoJournal { path: PathBuf },

    #[snafu(display("failed to acquire exclusive lock on {:?}: {}", path, source))]
    ExclusiveLock { path: PathBuf, source: LockError },

    #[snafu(display("I/O error during check: {}", source))]
    ScanIo { source: io::Error },
}

impl CheckError {
    /// Maps this error onto the `jfsck()` sentinel values from spec.md §6.
    pub fn sentinel(&self) -> i32 {
        match self {
            CheckError::NoSuchFile { .. } => -1,
            CheckError::NoJournal { .. } => -2,
            CheckError::ExclusiveLock { .. } | CheckError::ScanIo { .. } => -3,
        }
    }
}

/// Errors starting or stopping the autosync worker (C6).
#[derive(Debug, Snafu)]
pub enum AutosyncError {
    #[snafu(display("an autosync worker is already running for this handle"))]
    AlreadyRunning,
}
