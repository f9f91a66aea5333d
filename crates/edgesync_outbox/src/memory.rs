//! In-memory log backend for tests and ephemeral outboxes.

use crate::backend::LogBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory log backend.
///
/// Clones share the same bytes, so a log "reopened" through
/// [`crate::MemoryStorage`] sees everything written before.
///
/// ```rust
/// use edgesync_outbox::{LogBackend, MemoryBackend};
///
/// let mut backend = MemoryBackend::new();
/// let offset = backend.append(b"record").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 6);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    failing_appends: Arc<AtomicUsize>,
    failing_syncs: Arc<AtomicUsize>,
    failing_truncates: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing bytes.
    ///
    /// Useful for testing recovery.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            ..Self::default()
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes the next `count` appends write half their data and fail.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` syncs fail after the data was written.
    pub fn fail_next_syncs(&self, count: usize) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` truncates fail without changing the data.
    pub fn fail_next_truncates(&self, count: usize) {
        self.failing_truncates.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(io::Error::other(format!("injected {what} failure")))
}

impl LogBackend for MemoryBackend {
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        Ok(self.data())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        if take_failure(&self.failing_appends) {
            data.extend_from_slice(&new_data[..new_data.len() / 2]);
            return Err(injected("append"));
        }
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if take_failure(&self.failing_syncs) {
            return Err(injected("sync"));
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if take_failure(&self.failing_truncates) {
            return Err(injected("truncate"));
        }
        let mut data = self.data.write();
        let current_size = data.len() as u64;

        if new_size > current_size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, current_size
                ),
            )));
        }

        data.truncate(new_size as usize);
        Ok(())
    }

    fn rewrite(&mut self, new_data: &[u8]) -> StorageResult<()> {
        *self.data.write() = new_data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let mut a = MemoryBackend::new();
        let b = a.clone();
        a.append(b"abc").unwrap();
        assert_eq!(b.data(), b"abc");
    }

    #[test]
    fn injected_failure_leaves_partial_write() {
        let mut backend = MemoryBackend::new();
        backend.fail_next_appends(1);
        assert!(backend.append(b"abcdef").is_err());
        assert_eq!(backend.data(), b"abc");

        backend.truncate(0).unwrap();
        backend.append(b"xy").unwrap();
        assert_eq!(backend.data(), b"xy");
    }

    #[test]
    fn truncate_beyond_size_fails() {
        let mut backend = MemoryBackend::with_data(vec![1, 2]);
        assert!(backend.truncate(5).is_err());
    }

    #[test]
    fn injected_truncate_failure_keeps_data() {
        let mut backend = MemoryBackend::with_data(vec![1, 2, 3]);
        backend.fail_next_truncates(1);
        assert!(backend.truncate(1).is_err());
        assert_eq!(backend.data(), vec![1, 2, 3]);
        backend.truncate(1).unwrap();
        assert_eq!(backend.data(), vec![1]);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let mut backend = MemoryBackend::with_data(vec![1, 2, 3]);
        backend.rewrite(&[9]).unwrap();
        assert_eq!(backend.size().unwrap(), 1);
    }
}
