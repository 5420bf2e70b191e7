//! In-memory storage backend for testing.

use parking_lot::RwLock;

use super::StorageBackend;
use crate::error::Result;

/// In-memory storage backend.
///
/// All data is stored in a flat byte buffer and lost when the backend
/// is dropped. Useful for unit tests and benchmarking; also handy for
/// simulating torn writes by poking at [`snapshot`](Self::snapshot)ed
/// content.
#[derive(Default)]
pub struct InMemoryBackend {
    /// Simulated file content.
    bytes: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates a new, empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current content (for crash-simulation tests).
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Replaces the entire content (for crash-simulation tests).
    pub fn restore(&self, content: Vec<u8>) {
        *self.bytes.write() = content;
    }

    /// Truncates the content to `len` bytes (for crash-simulation tests).
    pub fn truncate(&self, len: u64) {
        self.bytes.write().truncate(len as usize);
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let bytes = self.bytes.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of in-memory backend",
            )
            .into());
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_extends_and_reads_back() {
        let backend = InMemoryBackend::new();
        backend.write_all_at(&[7, 8, 9], 10).unwrap();
        assert_eq!(backend.len().unwrap(), 13);

        let mut buf = [0u8; 3];
        backend.read_exact_at(&mut buf, 10).unwrap();
        assert_eq!(buf, [7, 8, 9]);

        // The gap is zero-filled.
        let mut gap = [1u8; 10];
        backend.read_exact_at(&mut gap, 0).unwrap();
        assert_eq!(gap, [0u8; 10]);
    }

    #[test]
    fn read_past_end_fails() {
        let backend = InMemoryBackend::new();
        backend.write_all_at(&[1], 0).unwrap();
        let mut buf = [0u8; 2];
        assert!(backend.read_exact_at(&mut buf, 0).is_err());
    }

    #[test]
    fn truncate_shrinks() {
        let backend = InMemoryBackend::new();
        backend.write_all_at(&[1; 100], 0).unwrap();
        backend.truncate(40);
        assert_eq!(backend.len().unwrap(), 40);
    }
}
