//! Page device seam used by physical recovery.

use crate::error::CoreResult;

/// The slice of the page store that changeset redo writes through.
///
/// The journal does not own pages; during phase-1 recovery it reconciles
/// each journaled page image with the device and overwrites it. The device
/// is addressed in bytes, with pages aligned to the environment's page
/// size.
///
/// # Invariants
///
/// - `write_page(address, data)` overwrites the full page image at
///   `address` and flushes it synchronously before returning. It may extend
///   the device by exactly one page when `address == file_size()`.
/// - `truncate(n)` grows or shrinks the device to `n` bytes; redo uses it
///   to extend the device up to a journaled page address beyond the current
///   end.
pub trait PageDevice {
    /// Returns the current device size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn file_size(&self) -> CoreResult<u64>;

    /// Resizes the device to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails.
    fn truncate(&mut self, new_size: u64) -> CoreResult<()>;

    /// Overwrites the page at `address` with `data` and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or flush fails, or if `address` lies
    /// past `file_size()`.
    fn write_page(&mut self, address: u64, data: &[u8]) -> CoreResult<()>;

    /// Records the last blob page carried by a replayed changeset.
    ///
    /// # Errors
    ///
    /// Returns an error if the bookkeeping update fails.
    fn set_last_blob_page(&mut self, page_id: u64) -> CoreResult<()>;

    /// Reloads bookkeeping state after physical redo.
    ///
    /// Called once between the physical and logical recovery phases; the
    /// state may have been restored by the changesets just replayed. The
    /// default implementation does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    fn reload_state(&mut self) -> CoreResult<()> {
        Ok(())
    }
}
