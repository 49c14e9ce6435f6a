//! Journaled I/O for regular files.
//!
//! `jio` sits between application code and ordinary file-system I/O,
//! promoting individual writes and groups of writes into atomic, durable,
//! recoverable transactions. After any crash — process, OS, or power — a
//! file's contents reflect either all or none of each transaction, and
//! the [`checker`] module (or the `jfsck` binary) can reconcile partially
//! applied state from the on-disk journal.
//!
//! The crate is organized the same way the design document breaks the
//! system down:
//!
//! - [`journal_dir`] — per-file journal directory layout (create,
//!   allocate, enumerate, garbage-collect).
//! - [`range_lock`] — byte-range advisory locks coordinating concurrent
//!   users of the same data file.
//! - [`record`] — bit-exact encode/decode of a single transaction's
//!   on-disk record.
//! - [`transaction`] — build, commit, rollback, apply.
//! - [`handle`] — the open file handle applications interact with.
//! - [`autosync`] — the background lingering-commit flusher.
//! - [`checker`] — offline scan and recovery over a journal directory.
//! - [`posix`] and [`stream`] — thin façades mirroring the standard
//!   positional/vectored and buffered-stream file APIs.

mod autosync;
pub mod checker;
pub mod error;
pub mod flags;
pub mod handle;
pub mod journal_dir;
pub mod posix;
pub mod range_lock;
pub mod record;
pub mod stream;
pub mod transaction;

pub use error::{
    AutosyncError, CheckError, CommitError, CommitFailure, DecodeError, MoveJournalError,
    OpenError, RollbackError,
};
pub use flags::{OpenFlags, RecordFlags};
pub use handle::{JournaledFile, OpenOptions};
pub use stream::JournaledStream;
pub use transaction::{CommitReceipt, Operation, Transaction};
