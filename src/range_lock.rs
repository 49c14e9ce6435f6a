//! Range-lock manager (C2): exclusive advisory byte-range locks on a data
//! file, used to serialize commits/rollbacks that touch overlapping bytes
//! while letting non-overlapping commits proceed in parallel (spec §4.1,
//! §5 invariants 4–5).
//!
//! Built directly on `fcntl(F_SETLKW)`/`fcntl(F_SETLK)`, the same
//! mechanism the original C library uses and the idiom the retrieved
//! corpus reaches for when whole-file locking (`fs2`/`fs4`) isn't precise
//! enough (`nix::fcntl` is already a dependency elsewhere in the pack for
//! exactly this reason).

use std::fs::File;
use std::os::unix::io::AsRawFd;

use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;

use crate::error::{AcquireSnafu, LockError, ReleaseSnafu};
use snafu::ResultExt;

/// A contiguous byte range `[start, end)` on a data file, locked
/// exclusively for the lifetime of a commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    /// A range spanning the whole file, start to EOF, regardless of how
    /// large the file grows after the lock is taken — used by the
    /// checker (C7), which must exclude every other user of the data
    /// file for the duration of a scan (spec §4.5).
    pub fn whole_file() -> Range {
        Range {
            start: 0,
            end: u64::MAX,
        }
    }

    /// The union of a transaction's operation ranges, per spec §4.1: a
    /// single contiguous span from the lowest offset touched to the
    /// highest `offset + length`.
    pub fn union_of<'a>(ops: impl Iterator<Item = (i64, usize)>) -> Option<Range> {
        let mut start: Option<u64> = None;
        let mut end: Option<u64> = None;
        for (offset, len) in ops {
            let offset = offset as u64;
            let op_end = offset + len as u64;
            start = Some(start.map_or(offset, |s| s.min(offset)));
            end = Some(end.map_or(op_end, |e| e.max(op_end)));
        }
        match (start, end) {
            (Some(s), Some(e)) => Some(Range { start: s, end: e }),
            _ => None,
        }
    }
}

/// An acquired lock. Dropping this without calling [`RangeLock::release`]
/// still releases the OS-level lock (closing/losing interest in the fd
/// would too), but `release` is how the caller observes and propagates a
/// failed unlock per spec §5's "every acquire has a matching release on
/// every exit path" rule.
pub struct RangeLock<'a> {
    file: &'a File,
    range: Range,
    active: bool,
}

impl<'a> RangeLock<'a> {
    /// Acquires an exclusive lock on `range` of `file`, blocking until
    /// granted. No deadlock avoidance is attempted beyond what the OS
    /// provides, because the engine never holds two overlapping acquires
    /// on the same file at once (spec §4.1).
    pub fn acquire(file: &'a File, range: Range) -> Result<Self, LockError> {
        let flock = make_flock(libc::F_WRLCK, range);
        fcntl(file.as_raw_fd(), FcntlArg::F_SETLKW(&flock)).context(AcquireSnafu {
            start: range.start,
            end: range.end,
        })?;
        Ok(RangeLock {
            file,
            range,
            active: true,
        })
    }

    /// Releases the lock, reporting failure instead of silently ignoring
    /// it, so a caller that must guarantee serialization can detect and
    /// act on an unlock that didn't take.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if !self.active {
            return Ok(());
        }
        let flock = make_flock(libc::F_UNLCK, self.range);
        fcntl(self.file.as_raw_fd(), FcntlArg::F_SETLK(&flock)).context(ReleaseSnafu {
            start: self.range.start,
            end: self.range.end,
        })?;
        self.active = false;
        Ok(())
    }
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.release_inner();
        }
    }
}

fn make_flock(lock_type: i32, range: Range) -> libc::flock {
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = lock_type as i16;
    flock.l_whence = libc::SEEK_SET as i16;
    flock.l_start = range.start as i64;
    // `l_len == 0` is POSIX for "lock to EOF, however large the file
    // grows" — the only sound encoding for `Range::whole_file()`, whose
    // `end` is a sentinel rather than a real offset.
    flock.l_len = if range.end == u64::MAX {
        0
    } else {
        (range.end - range.start) as i64
    };
    flock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_of_single_operation() {
        let range = Range::union_of(vec![(2i64, 5usize)].into_iter()).unwrap();
        assert_eq!(range, Range { start: 2, end: 7 });
    }

    #[test]
    fn union_of_overlapping_operations_spans_both() {
        let range = Range::union_of(vec![(2i64, 2usize), (3i64, 1usize)].into_iter()).unwrap();
        assert_eq!(range, Range { start: 2, end: 4 });
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let file = tempfile();
        let range = Range { start: 0, end: 16 };
        let lock = RangeLock::acquire(&file, range).expect("acquire");
        lock.release().expect("release");
    }

    fn tempfile() -> File {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::mem::forget(dir);
        std::fs::File::create(&path).unwrap();
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap()
    }
}
