//! Transaction engine (C4): build, commit, rollback, apply (spec §4.4).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;

use snafu::ResultExt;
use tracing::{debug, instrument, warn};

use crate::error::{
    CaptureUndoSnafu, CommitError, CommitFailure, IdAllocationSnafu, LockSnafu, RollbackError,
    WriteRecordSnafu,
};
use crate::flags::{self, OpenFlags, RecordFlags};
use crate::handle::JournaledFile;
use crate::range_lock::{Range, RangeLock};
use crate::record;

/// A single unscheduled write: bound to exactly one transaction, immutable
/// once added (spec §3).
#[derive(Debug, Clone)]
pub struct Operation {
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// An in-progress transaction: an ordered list of operations not yet
/// committed. Operations apply in insertion order; overlaps are
/// permitted, and the later operation wins (spec §3).
pub struct Transaction<'f> {
    file: &'f JournaledFile,
    ops: Vec<Operation>,
    flags: OpenFlags,
    is_rollback: bool,
}

/// What a successful commit returns: the byte count spec.md's
/// `jtrans_commit` promises, plus everything needed to later call
/// [`CommitReceipt::rollback`].
pub struct CommitReceipt<'f> {
    file: &'f JournaledFile,
    id: u64,
    ops: Vec<Operation>,
    undo_images: Option<Vec<Vec<u8>>>,
    flags: OpenFlags,
    bytes_written: usize,
}

impl<'f> Transaction<'f> {
    pub fn new(file: &'f JournaledFile, flags: OpenFlags) -> Self {
        Transaction {
            file,
            ops: Vec::new(),
            flags,
            is_rollback: false,
        }
    }

    /// Adds an operation to the transaction. The file is not touched —
    /// not even locked — until commit time.
    pub fn add(&mut self, buf: &[u8], offset: i64) -> Result<(), CommitFailure> {
        if offset < 0 {
            return Err(CommitFailure::InvalidOperation {
                reason: "offset must be non-negative",
            });
        }
        if buf.is_empty() {
            return Err(CommitFailure::InvalidOperation {
                reason: "operation payload must not be empty",
            });
        }
        self.ops.push(Operation {
            offset,
            payload: buf.to_vec(),
        });
        Ok(())
    }

    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Total bytes summed across every operation added so far.
    pub fn pending_bytes(&self) -> usize {
        self.ops.iter().map(|o| o.payload.len()).sum()
    }

    /// Commits the transaction per the protocol in spec §4.4.
    #[instrument(skip(self), fields(ops = self.ops.len()))]
    pub fn commit(self) -> Result<CommitReceipt<'f>, CommitError> {
        commit_inner(self.file, self.ops, self.flags, self.is_rollback)
    }
}

fn atomic(source: CommitFailure) -> CommitError {
    CommitError::Atomic { source }
}

fn commit_inner<'f>(
    file: &'f JournaledFile,
    ops: Vec<Operation>,
    flags: OpenFlags,
    is_rollback: bool,
) -> Result<CommitReceipt<'f>, CommitError> {
    if ops.is_empty() {
        return Err(atomic(CommitFailure::InvalidOperation {
            reason: "transaction has no operations",
        }));
    }
    if flags.contains(OpenFlags::RDONLY) || file.read_only() {
        return Err(atomic(CommitFailure::ReadOnly));
    }

    let total_len: usize = ops.iter().map(|o| o.payload.len()).sum();
    let limit = file.max_record_size();
    if total_len > limit {
        return Err(atomic(CommitFailure::RecordTooLarge {
            total: total_len,
            limit,
        }));
    }

    let id = file
        .journal_dir()
        .allocate_id()
        .context(IdAllocationSnafu)
        .map_err(atomic)?;

    let range = Range::union_of(ops.iter().map(|o| (o.offset, o.payload.len())))
        .expect("non-empty operation list has a union range");

    let lock = if !flags.contains(OpenFlags::NOLOCK) {
        Some(
            RangeLock::acquire(file.data_file(), range)
                .context(LockSnafu)
                .map_err(atomic)?,
        )
    } else {
        None
    };

    let outcome = run_commit_body(file, &ops, flags, is_rollback, id);

    if let Some(lock) = lock {
        if let Err(e) = lock.release() {
            warn!(error = %e, "failed to release range lock after commit");
        }
    }

    outcome.map(|(bytes_written, undo_images)| CommitReceipt {
        file,
        id,
        ops,
        undo_images,
        flags,
        bytes_written,
    })
}

fn run_commit_body(
    file: &JournaledFile,
    ops: &[Operation],
    flags: OpenFlags,
    is_rollback: bool,
    id: u64,
) -> Result<(usize, Option<Vec<Vec<u8>>>), CommitError> {
    let want_undo = !flags.contains(OpenFlags::NOROLLBACK) && !flags.contains(OpenFlags::RDONLY);
    let undo_images = if want_undo {
        Some(
            capture_undo(file.data_file(), ops)
                .context(CaptureUndoSnafu)
                .map_err(atomic)?,
        )
    } else {
        None
    };

    let record_flags = RecordFlags::for_commit(flags, is_rollback);
    let op_slices: Vec<(i64, &[u8])> = ops.iter().map(|o| (o.offset, o.payload.as_slice())).collect();
    let encoded = record::encode(id, record_flags, &op_slices, undo_images.as_deref());

    let record_path = file.journal_dir().record_path(id);
    let mut record_file = write_precommit(&record_path, &encoded)
        .context(WriteRecordSnafu)
        .map_err(atomic)?;
    // The record file's own `sync_all` (inside `write_precommit`) does not
    // make the directory entry that names it durable — fsync the journal
    // directory itself, or a crash here can lose the record entirely even
    // though its bytes are on disk.
    file.journal_dir()
        .sync()
        .context(WriteRecordSnafu)
        .map_err(atomic)?;
    mark_committed(&mut record_file, &encoded)
        .context(WriteRecordSnafu)
        .map_err(atomic)?;
    file.journal_dir()
        .sync()
        .context(WriteRecordSnafu)
        .map_err(atomic)?;
    debug!(id, "journal record committed");

    if flags.contains(OpenFlags::LINGER) {
        let bytes: usize = ops.iter().map(|o| o.payload.len()).sum();
        file.enqueue_linger(id, ops.to_vec());
        return Ok((bytes, undo_images));
    }

    match apply_ops(file.data_file(), ops) {
        Ok(bytes) => {
            if let Err(e) = file.data_file().sync_all() {
                return Err(CommitError::Severe {
                    applied: ops.len(),
                    total: ops.len(),
                    trans_id: id,
                    source: e,
                });
            }
            if let Err(e) = file.journal_dir().remove_record(id) {
                warn!(id, error = %e, "failed to retire journal record after apply");
            }
            Ok((bytes, undo_images))
        }
        Err((applied, e)) => Err(CommitError::Severe {
            applied,
            total: ops.len(),
            trans_id: id,
            source: e,
        }),
    }
}

fn write_precommit(path: &std::path::Path, encoded: &[u8]) -> io::Result<File> {
    let mut precommit = encoded.to_vec();
    let raw_flags = u32::from_le_bytes(precommit[8..12].try_into().unwrap());
    let cleared = raw_flags & !flags::COMMITTED;
    precommit[8..12].copy_from_slice(&cleared.to_le_bytes());

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    f.write_all(&precommit)?;
    f.sync_all()?;
    Ok(f)
}

fn mark_committed(f: &mut File, encoded: &[u8]) -> io::Result<()> {
    let final_flags = &encoded[8..12];
    f.write_all_at(final_flags, record::FLAGS_OFFSET)?;
    f.sync_all()
}

/// Reads back the bytes that currently exist at each operation's range,
/// for undo purposes. Bytes past the current end of file read as zero,
/// matching the sparse-extension semantics of a write past EOF.
fn capture_undo(data_file: &File, ops: &[Operation]) -> io::Result<Vec<Vec<u8>>> {
    let file_len = data_file.metadata()?.len();
    let mut images = Vec::with_capacity(ops.len());
    for op in ops {
        let offset = op.offset as u64;
        let len = op.payload.len();
        let mut buf = vec![0u8; len];
        if offset < file_len {
            let available = ((file_len - offset) as usize).min(len);
            data_file.read_exact_at(&mut buf[..available], offset)?;
        }
        images.push(buf);
    }
    Ok(images)
}

/// Writes each operation's payload in insertion order. On a mid-way
/// failure, returns how many operations had already landed so the caller
/// can report a severe failure accurately (spec §4.4, §7).
pub(crate) fn apply_ops(data_file: &File, ops: &[Operation]) -> Result<usize, (usize, io::Error)> {
    let mut total = 0usize;
    for (i, op) in ops.iter().enumerate() {
        match data_file.write_all_at(&op.payload, op.offset as u64) {
            Ok(()) => total += op.payload.len(),
            Err(e) => return Err((i, e)),
        }
    }
    Ok(total)
}

impl<'f> CommitReceipt<'f> {
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn trans_id(&self) -> u64 {
        self.id
    }

    /// Rolls back this transaction: commits a new transaction whose
    /// operations are T's undo images, applied in reverse of T's
    /// insertion order so overlapping ranges end up exactly as they were
    /// before T (spec §4.4 "Rollback protocol").
    #[instrument(skip(self), fields(id = self.id))]
    pub fn rollback(self) -> Result<CommitReceipt<'f>, RollbackError> {
        let undo_images = self
            .undo_images
            .ok_or(RollbackError::NoRollbackInfo)?;

        let rev_ops: Vec<Operation> = self
            .ops
            .iter()
            .zip(undo_images.iter())
            .rev()
            .map(|(op, undo)| Operation {
                offset: op.offset,
                payload: undo.clone(),
            })
            .collect();

        commit_inner(self.file, rev_ops, self.flags, true)
            .map_err(|source| RollbackError::Commit { source })
    }
}
