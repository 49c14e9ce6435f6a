//! POSIX façade (C8's sibling): thin wrappers over [`crate::handle`]
//! mirroring the standard positional/vectored file API names (spec §6).
//!
//! Every function here just forwards to the like-named method on
//! [`JournaledFile`] — the façade exists so callers migrating from plain
//! `read(2)`/`write(2)`/`pread(2)`/`pwrite(2)` call sites can swap the
//! file descriptor for a `&JournaledFile` with the same call shape,
//! rather than because the wrappers do anything [`JournaledFile`]
//! doesn't already do directly.

use std::io::{self, IoSlice, IoSliceMut, SeekFrom};

use crate::error::CommitError;
use crate::handle::JournaledFile;
use crate::transaction::CommitReceipt;

pub fn read(file: &JournaledFile, buf: &mut [u8]) -> io::Result<usize> {
    file.read(buf)
}

pub fn pread(file: &JournaledFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.pread(buf, offset)
}

pub fn readv(file: &JournaledFile, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    file.readv(bufs)
}

pub fn preadv(file: &JournaledFile, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize> {
    file.preadv(bufs, offset)
}

pub fn write<'f>(file: &'f JournaledFile, buf: &[u8]) -> Result<CommitReceipt<'f>, CommitError> {
    file.write(buf)
}

pub fn pwrite<'f>(
    file: &'f JournaledFile,
    buf: &[u8],
    offset: u64,
) -> Result<CommitReceipt<'f>, CommitError> {
    file.pwrite(buf, offset)
}

pub fn writev<'f>(
    file: &'f JournaledFile,
    bufs: &[IoSlice<'_>],
) -> Result<CommitReceipt<'f>, CommitError> {
    file.writev(bufs)
}

pub fn pwritev<'f>(
    file: &'f JournaledFile,
    bufs: &[IoSlice<'_>],
    offset: u64,
) -> Result<CommitReceipt<'f>, CommitError> {
    file.pwritev(bufs, offset)
}

/// Extends or shortens the file atomically (spec §6 `truncate`).
pub fn truncate(file: &JournaledFile, len: u64) -> Result<CommitReceipt<'_>, CommitError> {
    file.truncate(len)
}

pub fn seek(file: &JournaledFile, pos: SeekFrom) -> io::Result<u64> {
    file.seek(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::OpenOptions;

    #[test]
    fn pwrite_then_pread_round_trips() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        let file = OpenOptions::new().open(&path).unwrap();

        pwrite(&file, b"HELLO", 2).unwrap();
        let mut buf = [0u8; 5];
        let n = pread(&file, &mut buf, 2).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"HELLO");
    }

    #[test]
    fn non_positional_write_advances_the_cursor() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        let file = OpenOptions::new().open(&path).unwrap();

        write(&file, b"AB").unwrap();
        write(&file, b"CD").unwrap();
        assert_eq!(file.tell(), 4);
        assert_eq!(&std::fs::read(&path).unwrap()[0..4], b"ABCD");
    }

    #[test]
    fn truncate_down_then_rollback_restores_tail() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"ABCDEFGH").unwrap();
        let file = OpenOptions::new().open(&path).unwrap();

        let receipt = truncate(&file, 4).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ABCD".to_vec());

        let rolled_back = receipt.rollback().unwrap();
        assert!(rolled_back.bytes_written() > 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"ABCDEFGH".to_vec());
    }

    #[test]
    fn truncate_up_pads_with_zeros() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"AB").unwrap();
        let file = OpenOptions::new().open(&path).unwrap();

        truncate(&file, 5).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"AB\0\0\0".to_vec());
    }

    #[test]
    fn writev_commits_all_buffers_atomically() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![0u8; 8]).unwrap();
        let file = OpenOptions::new().open(&path).unwrap();

        let bufs = [IoSlice::new(b"AB"), IoSlice::new(b"CD")];
        let receipt = pwritev(&file, &bufs, 0).unwrap();
        assert_eq!(receipt.bytes_written(), 4);
        assert_eq!(&std::fs::read(&path).unwrap()[0..4], b"ABCD");
    }
}
