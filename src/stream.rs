//! Stream façade (C8): emulates buffered-stream (`fopen`/`fread`/`fwrite`)
//! semantics on top of the core file handle (spec §6).
//!
//! Every `fopen`-style mode string maps to [`OpenFlags`] plus an
//! open-time action (`"w"` truncates; `"a"` forces every write to the
//! current end of file, POSIX `O_APPEND`-style):
//!
//! | mode   | flags constructed          | on open          |
//! |--------|-----------------------------|------------------|
//! | `"r"`  | `RDONLY`                   | —                |
//! | `"r+"` | (none)                     | —                |
//! | `"w"`  | (none)                     | truncate to 0    |
//! | `"w+"` | (none)                     | truncate to 0    |
//! | `"a"`  | (none), append-on-write    | seek to EOF      |
//! | `"a+"` | (none), append-on-write    | seek to EOF      |

use std::io::{self, SeekFrom};
use std::path::Path;

use crate::error::OpenError;
use crate::flags::OpenFlags;
use crate::handle::{JournaledFile, OpenOptions};

/// A buffered-stream-style wrapper over a [`JournaledFile`], tracking
/// `eof`/`error` flags the way `feof(3)`/`ferror(3)` do instead of
/// surfacing a `Result` from every call (spec §6 stream façade).
pub struct JournaledStream {
    file: JournaledFile,
    append: bool,
    eof: bool,
    error: bool,
}

impl JournaledStream {
    /// Opens `path` with an `fopen`-style mode string (spec §6
    /// `jfs_*`/stream-open entry point).
    pub fn open<P: AsRef<Path>>(path: P, mode: &str) -> Result<Self, OpenError> {
        let (flags, truncate, append) = parse_mode(mode)?;
        let file = OpenOptions::new().flags(flags).open(path)?;

        if truncate {
            // An empty file is already length 0; `truncate` on an
            // already-matching length is rejected as a no-op, so only
            // call it when there's actually something to drop.
            if file.data_file_len()? > 0 {
                let _ = file.truncate(0);
            }
        }
        let mut stream = JournaledStream {
            file,
            append,
            eof: false,
            error: false,
        };
        if append {
            let _ = stream.seek(SeekFrom::End(0));
        }
        Ok(stream)
    }

    /// Reads up to `elem_size * count` bytes, returning the number of
    /// whole elements actually read — `fread(3)` semantics. Sets the
    /// `eof` flag on a short read.
    pub fn read(&mut self, buf: &mut [u8], elem_size: usize, count: usize) -> usize {
        if elem_size == 0 {
            return 0;
        }
        let want = (elem_size * count).min(buf.len());
        match self.file.read(&mut buf[..want]) {
            Ok(n) => {
                if n < want {
                    self.eof = true;
                }
                n / elem_size
            }
            Err(_) => {
                self.error = true;
                0
            }
        }
    }

    /// Writes `elem_size * count` bytes, returning the number of whole
    /// elements actually committed — `fwrite(3)` semantics. Each call is
    /// one atomic transaction (spec §3); a short element count on error
    /// never reflects a partially-applied element, since commit is
    /// atomic at the byte level already.
    pub fn write(&mut self, buf: &[u8], elem_size: usize, count: usize) -> usize {
        if elem_size == 0 {
            return 0;
        }
        let want = (elem_size * count).min(buf.len());
        let result = if self.append {
            let end = match self.file.data_file_len() {
                Ok(len) => len,
                Err(_) => {
                    self.error = true;
                    return 0;
                }
            };
            self.file.pwrite(&buf[..want], end)
        } else {
            self.file.write(&buf[..want])
        };
        match result {
            Ok(receipt) => receipt.bytes_written() / elem_size,
            Err(_) => {
                self.error = true;
                0
            }
        }
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn error(&self) -> bool {
        self.error
    }

    /// Clears both flags — `clearerr(3)`.
    pub fn clear_error(&mut self) {
        self.eof = false;
        self.error = false;
    }

    /// `ftell(3)`.
    pub fn tell(&self) -> u64 {
        self.file.tell()
    }

    /// `fseek(3)`. Clears `eof` the way a successful seek past a
    /// previous short read does in the C stdio model.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = self.file.seek(pos);
        if result.is_ok() {
            self.eof = false;
        }
        result
    }

    /// `rewind(3)`: seek to the start and clear both flags.
    pub fn rewind(&mut self) {
        let _ = self.file.seek(SeekFrom::Start(0));
        self.clear_error();
    }

    /// Drops to the core transactional API for callers that need
    /// multi-operation transactions, rollback, or the range-lock/autosync
    /// surface the stream façade doesn't expose.
    pub fn inner(&self) -> &JournaledFile {
        &self.file
    }
}

fn parse_mode(mode: &str) -> Result<(OpenFlags, bool, bool), OpenError> {
    match mode {
        "r" => Ok((OpenFlags::RDONLY, false, false)),
        "r+" => Ok((OpenFlags::empty(), false, false)),
        "w" | "w+" => Ok((OpenFlags::empty(), true, false)),
        "a" | "a+" => Ok((OpenFlags::empty(), false, true)),
        other => Err(OpenError::InvalidMode {
            mode: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_truncates_existing_contents() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"OLD CONTENT").unwrap();

        let mut stream = JournaledStream::open(&path, "w").unwrap();
        let n = stream.write(b"hi", 1, 2);
        assert_eq!(n, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"hi".to_vec());
    }

    #[test]
    fn read_past_eof_sets_eof_flag() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hi").unwrap();

        let mut stream = JournaledStream::open(&path, "r").unwrap();
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf, 1, 8);
        assert_eq!(n, 2);
        assert!(stream.eof());
        stream.clear_error();
        assert!(!stream.eof());
    }

    #[test]
    fn append_mode_always_writes_at_the_current_end() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"AB").unwrap();

        let mut stream = JournaledStream::open(&path, "a").unwrap();
        stream.write(b"CD", 1, 2);
        stream.write(b"EF", 1, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"ABCDEF".to_vec());
    }

    #[test]
    fn rewind_resets_position_and_flags() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello").unwrap();

        let mut stream = JournaledStream::open(&path, "r").unwrap();
        let mut buf = [0u8; 10];
        stream.read(&mut buf, 1, 10);
        assert!(stream.eof());

        stream.rewind();
        assert_eq!(stream.tell(), 0);
        assert!(!stream.eof());
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            JournaledStream::open(&path, "q"),
            Err(OpenError::InvalidMode { .. })
        ));
    }
}
