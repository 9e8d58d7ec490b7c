//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store backing one journal file.
///
/// Backends are **opaque byte stores**. The journal interprets the bytes;
/// the backend only reads, appends, truncates, and syncs them.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `truncate(n)` discards all data past `n`; the next `append` writes at
///   offset `n`
/// - `sync` ensures all appended data survives process termination
/// - Backends must be `Send + Sync`
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset` (positional read).
    ///
    /// Recovery is the only reader; it treats `ReadPastEnd` as a truncated
    /// tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the read would extend beyond the current size or
    /// an I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes buffered writes to the operating system.
    ///
    /// This is a visibility boundary, not a durability guarantee; use
    /// [`StorageBackend::sync`] for stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage (fsync).
    ///
    /// After this returns successfully, all previously appended data is
    /// guaranteed to survive power loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the storage to the given size.
    ///
    /// Used when a journal file is recycled (`truncate(0)`) and when a
    /// recovered device must be cut back. All data after `new_size` is
    /// discarded and the append position moves to `new_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
