//! Replay store seam used by logical recovery.

use crate::error::CoreResult;
use crate::types::DbName;

/// The database operations logical recovery re-applies.
///
/// Implementations are the replay path into the store: they must not take
/// transaction-level locks, and they apply operations exactly as logged.
/// Databases are addressed by their numeric name; `open_db` is called
/// before the first operation on a database and `close_db` once replay is
/// torn down.
///
/// Transactional operations do not flow through this trait directly during
/// replay - they are buffered on their transaction and applied through the
/// same methods by [`TransactionManager::flush_committed`] once the
/// transaction's commit marker has been replayed.
///
/// [`TransactionManager::flush_committed`]: crate::TransactionManager::flush_committed
pub trait ReplayStore {
    /// Opens (or looks up) the database `name` for replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    fn open_db(&mut self, name: DbName) -> CoreResult<()>;

    /// Closes a database previously opened via `open_db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the close fails.
    fn close_db(&mut self, name: DbName) -> CoreResult<()>;

    /// Inserts `key` → `record` into database `name` with the logged flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert(&mut self, name: DbName, key: &[u8], record: &[u8], flags: u32) -> CoreResult<()>;

    /// Erases `key` from database `name` with the logged flags.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] when the key does not exist;
    /// replay absorbs that case.
    ///
    /// [`CoreError::KeyNotFound`]: crate::CoreError::KeyNotFound
    fn erase(
        &mut self,
        name: DbName,
        key: &[u8],
        flags: u32,
        duplicate_index: u32,
    ) -> CoreResult<()>;
}
