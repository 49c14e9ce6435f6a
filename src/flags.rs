//! Flag bits shared between the public API and the on-disk record format.
//!
//! The numeric values match the `J_*` constants from the original C header
//! bit-for-bit (spec §6): `NOLOCK=1`, `NOROLLBACK=2`, `LINGER=4`,
//! `COMMITTED=8`, `ROLLBACKED=16`, `ROLLBACKING=32`, `RDONLY=64`. The raw
//! `u32` is what actually gets persisted in a journal record's header —
//! a decoder needs `NOROLLBACK` to know whether undo images follow the
//! payloads, so the full bitset travels to disk even though only a subset
//! of it describes record *state* rather than session *intent*.
//!
//! At the API boundary the bits are split into two `bitflags!` types so a
//! caller can't, say, pass `COMMITTED` to [`crate::handle::OpenOptions`].
//! Each type is a view over the same raw bits, not a separate encoding.

use bitflags::bitflags;

pub(crate) const NOLOCK: u32 = 1;
pub(crate) const NOROLLBACK: u32 = 2;
pub(crate) const LINGER: u32 = 4;
pub(crate) const COMMITTED: u32 = 8;
pub(crate) const ROLLBACKED: u32 = 16;
pub(crate) const ROLLBACKING: u32 = 32;
pub(crate) const RDONLY: u32 = 64;

bitflags! {
    /// Session-only flags: passed to `jopen`/`jtrans_init` equivalents,
    /// never inspected by a third party reading the journal directory
    /// cold, except for `NOROLLBACK` which the codec must persist.
    pub struct OpenFlags: u32 {
        const NOLOCK = NOLOCK;
        const NOROLLBACK = NOROLLBACK;
        const LINGER = LINGER;
        const RDONLY = RDONLY;
    }
}

bitflags! {
    /// Flags a cold reader of the journal directory (the checker, or a
    /// recovering process) inspects in a record's header.
    pub struct RecordFlags: u32 {
        const NOROLLBACK = NOROLLBACK;
        const COMMITTED = COMMITTED;
        const ROLLBACKED = ROLLBACKED;
        const ROLLBACKING = ROLLBACKING;
    }
}

impl RecordFlags {
    /// Derives the raw on-disk header flags for a transaction about to be
    /// committed: carries `NOROLLBACK` over from the session flags (the
    /// codec needs it to know whether undo images follow), and sets
    /// `ROLLBACKED` when this record is itself the undo transaction for an
    /// earlier commit.
    pub(crate) fn for_commit(open_flags: OpenFlags, is_rollback: bool) -> Self {
        let mut flags = RecordFlags::empty();
        if open_flags.contains(OpenFlags::NOROLLBACK) {
            flags |= RecordFlags::NOROLLBACK;
        }
        if is_rollback {
            flags |= RecordFlags::ROLLBACKED;
        }
        flags
    }

    pub(crate) fn has_undo_images(self) -> bool {
        !self.contains(RecordFlags::NOROLLBACK)
    }
}
