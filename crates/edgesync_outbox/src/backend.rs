//! Log backend trait definition.

use crate::error::StorageResult;

/// An append-only byte log holding one edge's records.
///
/// Backends are **opaque byte stores**: record framing and recovery live
/// in the outbox, not here.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - after `sync` returns, all appended data survives process termination
/// - `truncate` and `rewrite` are the only ways bytes disappear
pub trait LogBackend: Send + Sync {
    /// Reads the whole log.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the log.
    ///
    /// Returns the offset where the data was written. On error, a prefix of
    /// `data` may have been written; callers roll back with `truncate`.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Cuts the log back to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole log with `data`.
    ///
    /// After a crash the log holds either the old or the new contents.
    fn rewrite(&mut self, data: &[u8]) -> StorageResult<()>;
}
