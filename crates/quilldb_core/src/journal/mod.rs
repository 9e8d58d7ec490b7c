//! The write-ahead journal.
//!
//! The journal records every logical mutation (transaction begin, commit,
//! abort, insert, erase) and every physical page changeset before the
//! corresponding in-memory state becomes authoritative. It writes to a
//! **pair of files** and rotates between them: a file can be truncated and
//! reused once no transaction begun in it is still in flight, which keeps
//! the log bounded without a compaction pass.
//!
//! ## Entry format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ EntryHeader (26)                                             │
//! │ ┌───────┬─────────┬─────────┬──────────┬───────────────────┐ │
//! │ │lsn (8)│txnid (8)│ kind (4)│dbname (2)│ followup_size (4) │ │
//! │ └───────┴─────────┴─────────┴──────────┴───────────────────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ per-kind payload header + variable data (followup_size)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability discipline
//!
//! Entries are staged in a per-file `WriteBuffer` and reach the file on
//! commit, on changeset, or when the buffer passes a 1 MiB watermark.
//! Commits and changesets fsync iff the environment enables it; begin and
//! abort markers ride along with the next flush (an incomplete transaction
//! is rolled back by recovery anyway).
//!
//! ## Single writer
//!
//! All appenders require `&mut self`; the environment serializes mutations.
//! Only [`Journal::transaction_flushed`] and [`Journal::changeset_flushed`]
//! may be called concurrently (by the page flusher); they touch nothing but
//! the atomic rotation counters.

mod buffer;
mod entry;
mod iterator;
mod recovery;

pub use entry::{
    ChangesetHeader, EntryHeader, EntryKind, EraseHeader, InsertHeader, PageHeader,
    ENTRY_HEADER_SIZE,
};
pub use iterator::JournalCursor;

use crate::compress::Compressor;
use crate::config::EnvConfig;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::{DbName, Lsn, TxnId};
use buffer::WriteBuffer;
use quilldb_storage::{FileBackend, StorageBackend};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Buffer size at which an automatic (non-fsyncing) flush kicks in.
///
/// Checked only at entry boundaries so that header positions recorded for
/// in-place patching stay valid.
const BUFFER_FLUSH_WATERMARK: usize = 1024 * 1024;

/// One dirty page handed to [`Journal::append_changeset`].
#[derive(Debug, Clone, Copy)]
pub struct ChangesetPage<'a> {
    /// Byte address of the page in the page store.
    pub address: u64,
    /// The full page image; must be exactly one page long.
    pub data: &'a [u8],
}

/// Read-only snapshot of the journal's byte counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalMetrics {
    /// Bytes written to the journal files since the journal was created.
    pub total_bytes_flushed: u64,
    /// Raw payload bytes handed to the compressor.
    pub bytes_before_compression: u64,
    /// Payload bytes actually stored (compressed or raw) when a compressor
    /// is configured.
    pub bytes_after_compression: u64,
}

/// The two-file write-ahead journal of an environment.
pub struct Journal {
    pub(crate) config: EnvConfig,
    pub(crate) files: [Box<dyn StorageBackend>; 2],
    buffers: [WriteBuffer; 2],
    pub(crate) current: usize,
    threshold: u32,
    pub(crate) disable_logging: bool,
    open_txn: [AtomicU32; 2],
    closed_txn: [AtomicU32; 2],
    pub(crate) compressor: Option<Compressor>,
    total_bytes_flushed: AtomicU64,
    bytes_before_compression: AtomicU64,
    bytes_after_compression: AtomicU64,
    changeset_fault: Option<u32>,
}

impl Journal {
    fn with_files(config: EnvConfig, files: [Box<dyn StorageBackend>; 2]) -> Self {
        let threshold = config.effective_switch_threshold();
        let compressor = Compressor::create(config.compression);
        Self {
            config,
            files,
            buffers: [WriteBuffer::new(), WriteBuffer::new()],
            current: 0,
            threshold,
            disable_logging: false,
            open_txn: [AtomicU32::new(0), AtomicU32::new(0)],
            closed_txn: [AtomicU32::new(0), AtomicU32::new(0)],
            compressor,
            total_bytes_flushed: AtomicU64::new(0),
            bytes_before_compression: AtomicU64::new(0),
            bytes_after_compression: AtomicU64::new(0),
            changeset_fault: None,
        }
    }

    /// Creates a fresh journal: both files are created empty at the paths
    /// derived from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be created.
    pub fn create(config: EnvConfig) -> CoreResult<Self> {
        let file0 = FileBackend::create(&config.journal_path(0))?;
        let file1 = FileBackend::create(&config.journal_path(1))?;
        Ok(Self::with_files(config, [Box::new(file0), Box::new(file1)]))
    }

    /// Opens the journal of an existing environment. Both files must
    /// already exist; recovery is the caller's next step.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be opened.
    pub fn open(config: EnvConfig) -> CoreResult<Self> {
        let file0 = FileBackend::open(&config.journal_path(0))?;
        let file1 = FileBackend::open(&config.journal_path(1))?;
        Ok(Self::with_files(config, [Box::new(file0), Box::new(file1)]))
    }

    /// Creates a journal over caller-provided backends.
    ///
    /// Used by tests (in-memory journals) and by environments with custom
    /// storage.
    #[must_use]
    pub fn with_backends(config: EnvConfig, files: [Box<dyn StorageBackend>; 2]) -> Self {
        Self::with_files(config, files)
    }

    /// Returns the configuration the journal was opened with.
    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Index of the file currently receiving appends.
    #[must_use]
    pub fn current_file(&self) -> usize {
        self.current
    }

    /// Number of transactions begun in file `idx` and not yet flushed.
    #[must_use]
    pub fn open_txn_count(&self, idx: usize) -> u32 {
        self.open_txn[idx].load(Ordering::Acquire)
    }

    /// Number of closed (aborted, flushed, or changeset-closed) entries
    /// accounted to file `idx`.
    #[must_use]
    pub fn closed_txn_count(&self, idx: usize) -> u32 {
        self.closed_txn[idx].load(Ordering::Acquire)
    }

    /// Size of journal file `idx` in bytes (excluding buffered entries).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    pub fn file_size(&self, idx: usize) -> CoreResult<u64> {
        Ok(self.files[idx].size()?)
    }

    /// Returns a snapshot of the byte counters.
    #[must_use]
    pub fn metrics(&self) -> JournalMetrics {
        JournalMetrics {
            total_bytes_flushed: self.total_bytes_flushed.load(Ordering::Relaxed),
            bytes_before_compression: self.bytes_before_compression.load(Ordering::Relaxed),
            bytes_after_compression: self.bytes_after_compression.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    /// Decides which file receives the next append.
    ///
    /// Keeps the current file while it is below the threshold. At the
    /// threshold the other file is recycled (truncated, counters reset) and
    /// becomes current - but only if no transaction begun in it is still
    /// open; otherwise the current file simply keeps growing.
    fn switch_files_maybe(&mut self) -> CoreResult<usize> {
        let current = self.current;
        let weight = self.open_txn[current].load(Ordering::Acquire)
            + self.closed_txn[current].load(Ordering::Acquire);
        if weight < self.threshold {
            return Ok(current);
        }

        let other = 1 - current;
        if self.open_txn[other].load(Ordering::Acquire) == 0 {
            self.clear_file(other)?;
            self.current = other;
            debug!(from = current, to = other, "rotated journal files");
        }

        Ok(self.current)
    }

    // ------------------------------------------------------------------
    // Append API
    // ------------------------------------------------------------------

    /// Journals the begin marker of `txn` and binds the transaction to the
    /// chosen file.
    ///
    /// Temporary transactions are not logged. The transaction's name, if
    /// any, is stored as the entry payload.
    ///
    /// # Errors
    ///
    /// Returns an error if rotation or a buffer flush fails.
    pub fn append_txn_begin(&mut self, txn: &mut Transaction, lsn: Lsn) -> CoreResult<()> {
        if self.disable_logging || txn.is_temporary() {
            return Ok(());
        }
        debug_assert!(!lsn.is_null(), "LSN 0 is reserved for end-of-log");

        let name: Option<Vec<u8>> = txn.name().map(|n| n.as_bytes().to_vec());

        let cur = self.switch_files_maybe()?;
        txn.set_log_desc(cur);

        let mut header = EntryHeader::new(EntryKind::TxnBegin, lsn, txn.id());
        if let Some(name) = &name {
            header.followup_size = name.len() as u32;
        }

        self.buffers[cur].append(&header.to_bytes());
        if let Some(name) = &name {
            self.buffers[cur].append(name);
        }
        self.maybe_flush_buffer(cur)?;

        self.open_txn[cur].fetch_add(1, Ordering::AcqRel);
        self.current = cur;
        Ok(())
    }

    /// Journals the abort marker of `txn` on the file the transaction is
    /// bound to.
    ///
    /// No fsync: an incomplete transaction is rolled back by recovery
    /// whether or not the abort marker reached the disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was never begun or a buffer
    /// flush fails.
    pub fn append_txn_abort(&mut self, txn: &mut Transaction, lsn: Lsn) -> CoreResult<()> {
        if self.disable_logging || txn.is_temporary() {
            return Ok(());
        }
        debug_assert!(!lsn.is_null(), "LSN 0 is reserved for end-of-log");

        let idx = txn
            .log_desc()
            .ok_or_else(|| CoreError::invalid_operation("transaction was never journaled"))?;

        self.dec_open_txn(idx);
        self.closed_txn[idx].fetch_add(1, Ordering::AcqRel);

        let header = EntryHeader::new(EntryKind::TxnAbort, lsn, txn.id());
        self.buffers[idx].append(&header.to_bytes());
        self.maybe_flush_buffer(idx)
    }

    /// Journals the commit marker of `txn` and flushes its file, fsyncing
    /// iff the environment enables fsync.
    ///
    /// The rotation counters are not touched here: the commit is durable,
    /// but the transaction still pins its file until the page flusher
    /// reports it via [`Journal::transaction_flushed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was never begun or the flush
    /// fails.
    pub fn append_txn_commit(&mut self, txn: &mut Transaction, lsn: Lsn) -> CoreResult<()> {
        if self.disable_logging || txn.is_temporary() {
            return Ok(());
        }
        debug_assert!(!lsn.is_null(), "LSN 0 is reserved for end-of-log");

        let idx = txn
            .log_desc()
            .ok_or_else(|| CoreError::invalid_operation("transaction was never journaled"))?;

        let header = EntryHeader::new(EntryKind::TxnCommit, lsn, txn.id());
        self.buffers[idx].append(&header.to_bytes());
        self.flush_buffer(idx, self.config.fsync_on_commit)
    }

    /// Journals an insert of `key` → `record` into database `db`.
    ///
    /// The entry and insert headers are written with provisional sizes,
    /// the key and record regions are appended (compressed when a
    /// compressor is configured and compression strictly shrinks the
    /// region), and the headers are patched in place with the final sizes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was never begun, compression
    /// fails, or a buffer flush fails.
    pub fn append_insert(
        &mut self,
        db: DbName,
        txn: &mut Transaction,
        key: &[u8],
        record: &[u8],
        flags: u32,
        lsn: Lsn,
    ) -> CoreResult<()> {
        if self.disable_logging {
            return Ok(());
        }
        debug_assert!(!lsn.is_null(), "LSN 0 is reserved for end-of-log");

        let (txn_id, idx) = self.resolve_op_target(txn)?;

        let mut header = EntryHeader::new(EntryKind::Insert, lsn, txn_id);
        header.dbname = db;
        header.followup_size = InsertHeader::SIZE as u32;

        let mut insert = InsertHeader {
            key_size: key.len() as u32,
            record_size: record.len() as u32,
            flags,
            ..Default::default()
        };

        let entry_position = self.buffers[idx].len();
        self.buffers[idx].append(&header.to_bytes());
        self.buffers[idx].append(&insert.to_bytes());

        let (stored_key, key_compressed) = self.append_payload_region(idx, key)?;
        insert.compressed_key_size = key_compressed;
        header.followup_size += stored_key;

        let (stored_record, record_compressed) = self.append_payload_region(idx, record)?;
        insert.compressed_record_size = record_compressed;
        header.followup_size += stored_record;

        self.buffers[idx].overwrite(entry_position, &header.to_bytes());
        self.buffers[idx].overwrite(entry_position + ENTRY_HEADER_SIZE, &insert.to_bytes());

        self.maybe_flush_buffer(idx)
    }

    /// Journals an erase of `key` from database `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction was never begun, compression
    /// fails, or a buffer flush fails.
    pub fn append_erase(
        &mut self,
        db: DbName,
        txn: &mut Transaction,
        key: &[u8],
        duplicate_index: u32,
        flags: u32,
        lsn: Lsn,
    ) -> CoreResult<()> {
        if self.disable_logging {
            return Ok(());
        }
        debug_assert!(!lsn.is_null(), "LSN 0 is reserved for end-of-log");

        let (txn_id, idx) = self.resolve_op_target(txn)?;

        let mut header = EntryHeader::new(EntryKind::Erase, lsn, txn_id);
        header.dbname = db;
        header.followup_size = EraseHeader::SIZE as u32;

        let mut erase = EraseHeader {
            key_size: key.len() as u32,
            flags,
            duplicate_index,
            ..Default::default()
        };

        let entry_position = self.buffers[idx].len();
        self.buffers[idx].append(&header.to_bytes());
        self.buffers[idx].append(&erase.to_bytes());

        let (stored_key, key_compressed) = self.append_payload_region(idx, key)?;
        erase.compressed_key_size = key_compressed;
        header.followup_size += stored_key;

        self.buffers[idx].overwrite(entry_position, &header.to_bytes());
        self.buffers[idx].overwrite(entry_position + ENTRY_HEADER_SIZE, &erase.to_bytes());

        self.maybe_flush_buffer(idx)
    }

    /// Journals a physical snapshot of dirty pages and flushes it, fsyncing
    /// iff the environment enables fsync.
    ///
    /// Returns the file index the changeset was written to, so the page
    /// flusher can call [`Journal::changeset_flushed`] once the pages
    /// themselves are durable; returns `None` while logging is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if `pages` is empty, a page image is not exactly
    /// one page long, compression fails, or the flush fails.
    pub fn append_changeset(
        &mut self,
        pages: &[ChangesetPage<'_>],
        last_blob_page: u64,
        lsn: Lsn,
    ) -> CoreResult<Option<usize>> {
        if self.disable_logging {
            return Ok(None);
        }
        debug_assert!(!lsn.is_null(), "LSN 0 is reserved for end-of-log");
        if pages.is_empty() {
            return Err(CoreError::invalid_operation("changeset without pages"));
        }

        let cur = self.switch_files_maybe()?;
        let page_size = self.config.page_size;

        let mut header = EntryHeader::new(EntryKind::Changeset, lsn, TxnId::NONE);
        header.followup_size = ChangesetHeader::SIZE as u32;
        let changeset = ChangesetHeader {
            num_pages: pages.len() as u32,
            last_blob_page,
        };

        let entry_position = self.buffers[cur].len();
        self.buffers[cur].append(&header.to_bytes());
        self.buffers[cur].append(&changeset.to_bytes());

        for page in pages {
            if page.data.len() != page_size {
                return Err(CoreError::invalid_operation(format!(
                    "changeset page at {} is {} bytes, page size is {page_size}",
                    page.address,
                    page.data.len()
                )));
            }
            header.followup_size += self.append_changeset_page(cur, page)?;
        }

        self.changeset_fault_checkpoint()?;

        self.buffers[cur].overwrite(entry_position, &header.to_bytes());

        self.changeset_fault_checkpoint()?;

        self.flush_buffer(cur, self.config.fsync_on_commit)?;

        self.changeset_fault_checkpoint()?;

        self.open_txn[cur].fetch_add(1, Ordering::AcqRel);
        Ok(Some(cur))
    }

    /// Appends one page record and returns its total on-disk size.
    fn append_changeset_page(&mut self, idx: usize, page: &ChangesetPage<'_>) -> CoreResult<u32> {
        let mut page_header = PageHeader {
            address: page.address,
            compressed_size: 0,
        };

        let header_position = self.buffers[idx].len();
        self.buffers[idx].append(&page_header.to_bytes());

        let (stored, compressed) = self.append_payload_region(idx, page.data)?;
        if compressed > 0 {
            page_header.compressed_size = compressed;
            self.buffers[idx].overwrite(header_position, &page_header.to_bytes());
        }

        Ok(PageHeader::SIZE as u32 + stored)
    }

    /// Resolves the file index and logged transaction ID for an insert or
    /// erase.
    ///
    /// Temporary operations rotate like a fresh transaction and count as
    /// immediately closed; transactional operations follow their
    /// transaction's log descriptor.
    fn resolve_op_target(&mut self, txn: &Transaction) -> CoreResult<(TxnId, usize)> {
        if txn.is_temporary() {
            let idx = self.switch_files_maybe()?;
            self.closed_txn[idx].fetch_add(1, Ordering::AcqRel);
            Ok((TxnId::NONE, idx))
        } else {
            let idx = txn
                .log_desc()
                .ok_or_else(|| CoreError::invalid_operation("transaction was never journaled"))?;
            Ok((txn.id(), idx))
        }
    }

    /// Appends one compressable payload region.
    ///
    /// Returns `(stored_len, compressed_size)` where `compressed_size` is 0
    /// when the region was stored raw. The compressed form is used only
    /// when strictly smaller than the raw bytes.
    fn append_payload_region(&mut self, idx: usize, data: &[u8]) -> CoreResult<(u32, u32)> {
        if let Some(compressor) = self.compressor.as_mut() {
            self.bytes_before_compression
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            let clen = compressor.compress(data)?;
            if clen < data.len() {
                self.buffers[idx].append(&compressor.arena()[..clen]);
                self.bytes_after_compression
                    .fetch_add(clen as u64, Ordering::Relaxed);
                return Ok((clen as u32, clen as u32));
            }
            self.bytes_after_compression
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        self.buffers[idx].append(data);
        Ok((data.len() as u32, 0))
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Flushes the buffer of file `idx` when it passed the watermark.
    ///
    /// Called only at entry boundaries, never inside a multi-part entry.
    fn maybe_flush_buffer(&mut self, idx: usize) -> CoreResult<()> {
        if self.buffers[idx].len() >= BUFFER_FLUSH_WATERMARK {
            self.flush_buffer(idx, false)?;
        }
        Ok(())
    }

    /// Writes the staged bytes of file `idx` to the file, optionally
    /// fsyncing afterwards.
    fn flush_buffer(&mut self, idx: usize, fsync: bool) -> CoreResult<()> {
        if !self.buffers[idx].is_empty() {
            let len = self.buffers[idx].len() as u64;
            self.files[idx].append(self.buffers[idx].as_slice())?;
            self.total_bytes_flushed.fetch_add(len, Ordering::Relaxed);
            self.buffers[idx].clear();
        }
        if fsync {
            self.files[idx].sync()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flusher callbacks
    // ------------------------------------------------------------------

    /// Reports that the page state of a committed transaction is durable.
    ///
    /// Called by the page flusher, possibly concurrently with appends;
    /// touches only the rotation counters.
    pub fn transaction_flushed(&self, txn: &Transaction) {
        if self.disable_logging {
            return;
        }
        if let Some(idx) = txn.log_desc() {
            self.dec_open_txn(idx);
            self.closed_txn[idx].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Reports that the pages of a changeset written to file `idx` are
    /// durable.
    ///
    /// Called by the page flusher with the index returned by
    /// [`Journal::append_changeset`].
    pub fn changeset_flushed(&self, idx: usize) {
        self.dec_open_txn(idx);
        self.closed_txn[idx].fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements an open-transaction counter without ever driving it
    /// below zero.
    fn dec_open_txn(&self, idx: usize) {
        let result = self.open_txn[idx].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |v| v.checked_sub(1),
        );
        debug_assert!(result.is_ok(), "open_txn[{idx}] underflow");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Truncates both files and resets all rotation state.
    ///
    /// # Errors
    ///
    /// Returns an error if a truncation fails.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.clear_file(0)?;
        self.clear_file(1)
    }

    /// Truncates file `idx`, resets its counters, and drops its staged
    /// bytes.
    fn clear_file(&mut self, idx: usize) -> CoreResult<()> {
        self.files[idx].truncate(0)?;
        self.open_txn[idx].store(0, Ordering::Release);
        self.closed_txn[idx].store(0, Ordering::Release);
        self.buffers[idx].clear();
        Ok(())
    }

    /// Closes the journal.
    ///
    /// On a normal shutdown (`keep_files == false`) both files are
    /// cleared. With `keep_files` the staged bytes are flushed instead so
    /// the files can be inspected or reopened for recovery - the path
    /// crash tests use.
    ///
    /// # Errors
    ///
    /// Returns an error if a flush or truncation fails.
    pub fn close(&mut self, keep_files: bool) -> CoreResult<()> {
        if keep_files {
            self.flush_buffer(0, false)?;
            self.flush_buffer(1, false)?;
        } else {
            self.clear()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Test hook: makes the `nth` fault checkpoint inside
    /// [`Journal::append_changeset`] fail with an I/O error (three
    /// checkpoints per append: before the header patch, after the patch,
    /// after the flush). Inert unless armed; disarms after firing.
    pub fn arm_changeset_fault(&mut self, nth: u32) {
        self.changeset_fault = Some(nth);
    }

    fn changeset_fault_checkpoint(&mut self) -> CoreResult<()> {
        if let Some(remaining) = self.changeset_fault.as_mut() {
            if *remaining == 0 {
                self.changeset_fault = None;
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "injected changeset fault",
                )));
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("current", &self.current)
            .field("threshold", &self.threshold)
            .field("disable_logging", &self.disable_logging)
            .field("open_txn", &self.open_txn)
            .field("closed_txn", &self.closed_txn)
            .finish_non_exhaustive()
    }
}
