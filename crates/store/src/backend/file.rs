//! File-based storage backend over positional I/O.
//!
//! Every access names its byte offset explicitly, so nothing in this
//! module depends on the file's shared cursor. Reads therefore need no
//! synchronization at all on Unix, where `pread(2)` works off a plain
//! shared handle; writes go through one small mutex around a unit
//! value, whose only job is to keep two page writes from interleaving
//! while the file grows.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use parking_lot::Mutex;

use super::StorageBackend;
use crate::error::Result;

/// Backend over one store file on disk.
///
/// Nothing here is durable on its own: written pages sit in the OS
/// cache until [`sync`](StorageBackend::sync) runs, and crash
/// consistency comes from the record manager's two-phase header
/// rewrite above this layer.
pub struct FileBackend {
    /// Shared handle; readers use it without taking any lock.
    file: File,
    /// Keeps page writes from interleaving. Holds no data on purpose:
    /// the file itself stays reachable for concurrent reads.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens the file at `path`, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the file cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path.as_ref())?;
        Ok(Self { file, write_lock: Mutex::new(()) })
    }
}

impl StorageBackend for FileBackend {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)
    }

    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.file, data, offset)
    }

    fn sync(&self) -> Result<()> {
        // Data only; the header swap does not rely on file metadata.
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

// Per-platform shims over positional I/O. Everything above talks in
// terms of whole-buffer reads and writes at an absolute offset; these
// translate that into whatever the OS offers.

/// Fills `buf` from `file` starting at byte `offset`.
///
/// Unix gets this in one call: [`FileExt::read_exact_at`] is `pread(2)`
/// underneath, which carries the position as an argument, leaving the
/// shared cursor alone. That property is what lets readers skip
/// locking entirely.
#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// On Windows the closest primitive is `seek_read`, which both reads
/// and repositions the shared cursor and may return short. Loop until
/// the buffer is full; anyone reading concurrently on this platform
/// has to bring their own lock.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file ended before the page was fully read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

/// Puts the whole of `data` into `file` at byte `offset` (`pwrite(2)`
/// on Unix, growing the file when the write lands past its end).
#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

/// Windows counterpart, looping over the possibly-short `seek_write`.
#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
