//! Two-phase crash recovery.
//!
//! Phase 1 (physical) replays every page changeset in both files,
//! chronologically: the file holding the older changeset first, then the
//! other. The highest changeset LSN seen becomes the *durable LSN* - page
//! state up to it is already on disk.
//!
//! Phase 2 (logical) walks both files with the two-file cursor and
//! re-applies transactional operations. Inserts and erases at or below the
//! durable LSN are skipped; transaction markers are always replayed so the
//! live-transaction picture is rebuilt exactly. At the end, transactions
//! without a commit marker are aborted and the committed ones are flushed
//! to the store.
//!
//! Both phases treat a truncated tail (short read or null LSN) as the
//! normal end of the log. An unknown entry kind is corruption and aborts
//! recovery.

use crate::device::PageDevice;
use crate::error::{CoreError, CoreResult};
use crate::journal::entry::{
    ChangesetHeader, EntryHeader, EntryKind, EraseHeader, InsertHeader, PageHeader,
    ENTRY_HEADER_SIZE,
};
use crate::journal::Journal;
use crate::replay::ReplayStore;
use crate::transaction::{PendingOp, TransactionManager};
use crate::types::{DbName, Lsn};
use quilldb_storage::StorageError;
use tracing::{debug, error, warn};

impl Journal {
    /// Recovers the store from the journal after an unclean shutdown.
    ///
    /// Runs the physical redo of changesets, lets the device reload its
    /// bookkeeping state, runs the logical redo when transactions are
    /// enabled, and finally clears both journal files.
    ///
    /// Recovery is idempotent: running it twice over the same files leaves
    /// the store in the same state as running it once.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption, on replay failures from the store,
    /// or on I/O failures other than a truncated tail.
    pub fn recover(
        &mut self,
        device: &mut dyn PageDevice,
        store: &mut dyn ReplayStore,
        txn_manager: &mut TransactionManager,
    ) -> CoreResult<()> {
        let start_lsn = self.recover_changesets(device)?;
        debug!(durable_lsn = start_lsn.as_u64(), "physical redo finished");

        // The device's bookkeeping pages may have been restored by the
        // changesets just replayed.
        device.reload_state()?;

        if self.config.enable_transactions {
            self.recover_journal(store, txn_manager, start_lsn)?;
        }

        self.clear()
    }

    /// Scans file `idx` for its oldest changeset.
    ///
    /// Returns [`Lsn::NULL`] when the file holds no changeset, ends in a
    /// truncated tail before one, or is empty.
    fn scan_for_oldest_changeset(&self, idx: usize) -> Lsn {
        let filesize = match self.files[idx].size() {
            Ok(size) => size,
            Err(_) => return Lsn::NULL,
        };

        let mut offset = 0u64;
        while offset < filesize {
            let header_bytes = match self.files[idx].read_at(offset, ENTRY_HEADER_SIZE) {
                Ok(bytes) => bytes,
                Err(_) => {
                    warn!(file = idx, offset, "truncated header while scanning for changesets");
                    return Lsn::NULL;
                }
            };
            let header = match EntryHeader::decode(&header_bytes) {
                Ok(header) => header,
                Err(_) => return Lsn::NULL,
            };

            if header.lsn.is_null() {
                break;
            }
            if header.entry_kind() == Some(EntryKind::Changeset) {
                return header.lsn;
            }

            offset += ENTRY_HEADER_SIZE as u64 + u64::from(header.followup_size);
        }

        Lsn::NULL
    }

    /// Phase 1: redo all changesets of both files, older file first.
    ///
    /// Returns the durable LSN: the highest changeset LSN replayed, or
    /// [`Lsn::NULL`] when neither file holds one.
    fn recover_changesets(&mut self, device: &mut dyn PageDevice) -> CoreResult<Lsn> {
        let lsn0 = self.scan_for_oldest_changeset(0);
        let lsn1 = self.scan_for_oldest_changeset(1);

        if lsn0.is_null() && lsn1.is_null() {
            return Ok(Lsn::NULL);
        }

        // A file without a changeset counts as newest; ties go to file 1.
        let order = |lsn: Lsn| {
            if lsn.is_null() {
                u64::MAX
            } else {
                lsn.as_u64()
            }
        };
        self.current = if order(lsn0) < order(lsn1) { 0 } else { 1 };

        let max0 = self.redo_all_changesets(self.current, device)?;
        let max1 = self.redo_all_changesets(1 - self.current, device)?;

        Ok(Lsn::new(max0.as_u64().max(max1.as_u64())))
    }

    /// Replays every changeset of file `idx` in file order.
    fn redo_all_changesets(&mut self, idx: usize, device: &mut dyn PageDevice) -> CoreResult<Lsn> {
        let mut max_lsn = Lsn::NULL;
        let log_size = self.files[idx].size()?;
        let page_size = self.config.page_size;
        let mut arena = vec![0u8; page_size];

        let mut offset = 0u64;
        while offset < log_size {
            let header_bytes = match self.read_or_tail(idx, offset, ENTRY_HEADER_SIZE)? {
                Some(bytes) => bytes,
                None => break,
            };
            let header = EntryHeader::decode(&header_bytes)?;
            if header.lsn.is_null() {
                break;
            }

            if header.entry_kind() != Some(EntryKind::Changeset) {
                offset += ENTRY_HEADER_SIZE as u64 + u64::from(header.followup_size);
                continue;
            }

            max_lsn = header.lsn;
            offset += ENTRY_HEADER_SIZE as u64;

            let changeset_bytes = match self.read_or_tail(idx, offset, ChangesetHeader::SIZE)? {
                Some(bytes) => bytes,
                None => break,
            };
            let changeset = ChangesetHeader::decode(&changeset_bytes)?;
            offset += ChangesetHeader::SIZE as u64;

            device.set_last_blob_page(changeset.last_blob_page)?;

            let mut device_size = device.file_size()?;

            for _ in 0..changeset.num_pages {
                let page_bytes = match self.read_or_tail(idx, offset, PageHeader::SIZE)? {
                    Some(bytes) => bytes,
                    None => return Ok(max_lsn),
                };
                let page_header = PageHeader::decode(&page_bytes)?;
                offset += PageHeader::SIZE as u64;

                if page_header.compressed_size > 0 {
                    let clen = page_header.compressed_size as usize;
                    let compressed = match self.read_or_tail(idx, offset, clen)? {
                        Some(bytes) => bytes,
                        None => return Ok(max_lsn),
                    };
                    offset += clen as u64;
                    let compressor = self.compressor.as_ref().ok_or_else(|| {
                        CoreError::corruption("compressed page without a configured compressor")
                    })?;
                    compressor.decompress_into(&compressed, &mut arena)?;
                } else {
                    let raw = match self.read_or_tail(idx, offset, page_size)? {
                        Some(bytes) => bytes,
                        None => return Ok(max_lsn),
                    };
                    offset += page_size as u64;
                    arena.copy_from_slice(&raw);
                }

                // Reconcile the journaled address with the device: extend
                // by one page at the end, truncate up to addresses beyond
                // it, overwrite in place otherwise.
                if page_header.address == device_size {
                    device_size += page_size as u64;
                } else if page_header.address > device_size {
                    device_size = page_header.address + page_size as u64;
                    device.truncate(device_size)?;
                }

                device.write_page(page_header.address, &arena)?;
            }
        }

        Ok(max_lsn)
    }

    /// Phase 2: logical redo of transactional operations.
    fn recover_journal(
        &mut self,
        store: &mut dyn ReplayStore,
        txn_manager: &mut TransactionManager,
        start_lsn: Lsn,
    ) -> CoreResult<()> {
        // Recovery starts from a clean slate: no live transactions.
        debug_assert!(txn_manager.is_empty());

        // Replayed operations must not be re-journaled.
        self.disable_logging = true;

        let mut opened: Vec<DbName> = Vec::new();
        let result = self.replay_entries(store, txn_manager, start_lsn, &mut opened);

        // Teardown runs even when replay failed: transactions with no
        // commit marker are rolled back and replay-opened databases are
        // closed before the error propagates.
        txn_manager.abort_uncommitted();

        let mut close_result: CoreResult<()> = Ok(());
        for db in opened {
            if let Err(e) = store.close_db(db) {
                error!(db = %db, "failed to close database after replay");
                if close_result.is_ok() {
                    close_result = Err(e);
                }
            }
        }

        let result = result
            .and(close_result)
            .and_then(|()| txn_manager.flush_committed(store));

        self.disable_logging = false;
        result
    }

    fn replay_entries(
        &mut self,
        store: &mut dyn ReplayStore,
        txn_manager: &mut TransactionManager,
        start_lsn: Lsn,
        opened: &mut Vec<DbName>,
    ) -> CoreResult<()> {
        let mut cursor = self.cursor();

        loop {
            let (header, payload) = self.read_entry(&mut cursor)?;
            if header.lsn.is_null() {
                break;
            }

            let Some(kind) = header.entry_kind() else {
                error!(
                    kind = header.kind,
                    lsn = header.lsn.as_u64(),
                    "invalid entry kind, journal is corrupt"
                );
                return Err(CoreError::corruption(format!(
                    "unknown entry kind {} at {}",
                    header.kind, header.lsn
                )));
            };

            match kind {
                EntryKind::TxnBegin => {
                    let name = if payload.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8(payload).map_err(|_| {
                            CoreError::corruption("transaction name is not valid UTF-8")
                        })?)
                    };
                    let provisional = txn_manager.begin(name.as_deref());
                    txn_manager.assume_id(provisional, header.txn_id)?;
                }

                EntryKind::TxnAbort => txn_manager.abort(header.txn_id)?,

                EntryKind::TxnCommit => txn_manager.commit(header.txn_id)?,

                EntryKind::Insert => {
                    // Already reflected in page state by a durable changeset.
                    if header.lsn <= start_lsn {
                        continue;
                    }

                    let insert = InsertHeader::decode(&payload)?;
                    let key_start = InsertHeader::SIZE;
                    let key_end = key_start + insert.stored_key_len();
                    let record_end = key_end + insert.stored_record_len();
                    if payload.len() < record_end {
                        return Err(CoreError::corruption(format!(
                            "insert payload at {} shorter than its headers claim",
                            header.lsn
                        )));
                    }

                    let key = self.replay_region(
                        &payload[key_start..key_end],
                        insert.compressed_key_size,
                        insert.key_size as usize,
                    )?;
                    let record = self.replay_region(
                        &payload[key_end..record_end],
                        insert.compressed_record_size,
                        insert.record_size as usize,
                    )?;

                    let db = header.dbname;
                    self.open_for_replay(store, opened, db)?;

                    if header.txn_id.is_none() {
                        store.insert(db, &key, &record, insert.flags)?;
                    } else {
                        let txn = txn_manager
                            .get_mut(header.txn_id)
                            .ok_or(CoreError::TransactionNotFound { id: header.txn_id })?;
                        txn.push_pending(PendingOp::Insert {
                            db,
                            key,
                            record,
                            flags: insert.flags,
                        });
                    }
                }

                EntryKind::Erase => {
                    if header.lsn <= start_lsn {
                        continue;
                    }

                    let erase = EraseHeader::decode(&payload)?;
                    let key_start = EraseHeader::SIZE;
                    let key_end = key_start + erase.stored_key_len();
                    if payload.len() < key_end {
                        return Err(CoreError::corruption(format!(
                            "erase payload at {} shorter than its header claims",
                            header.lsn
                        )));
                    }

                    let key = self.replay_region(
                        &payload[key_start..key_end],
                        erase.compressed_key_size,
                        erase.key_size as usize,
                    )?;

                    let db = header.dbname;
                    self.open_for_replay(store, opened, db)?;

                    if header.txn_id.is_none() {
                        // The key may already be gone: the erase might have
                        // hit the pages before the changeset was cut.
                        match store.erase(db, &key, erase.flags, erase.duplicate_index) {
                            Err(CoreError::KeyNotFound) => {}
                            other => other?,
                        }
                    } else {
                        let txn = txn_manager
                            .get_mut(header.txn_id)
                            .ok_or(CoreError::TransactionNotFound { id: header.txn_id })?;
                        txn.push_pending(PendingOp::Erase {
                            db,
                            key,
                            flags: erase.flags,
                            duplicate_index: erase.duplicate_index,
                        });
                    }
                }

                // Applied physically in phase 1.
                EntryKind::Changeset => {}
            }
        }

        Ok(())
    }

    /// Returns the raw bytes of a replayed region, decompressing when the
    /// entry recorded a compressed size.
    fn replay_region(
        &mut self,
        stored: &[u8],
        compressed_size: u32,
        raw_size: usize,
    ) -> CoreResult<Vec<u8>> {
        if compressed_size == 0 {
            return Ok(stored.to_vec());
        }
        let compressor = self.compressor.as_mut().ok_or_else(|| {
            CoreError::corruption("compressed entry without a configured compressor")
        })?;
        Ok(compressor.decompress(stored, raw_size)?.to_vec())
    }

    fn open_for_replay(
        &self,
        store: &mut dyn ReplayStore,
        opened: &mut Vec<DbName>,
        db: DbName,
    ) -> CoreResult<()> {
        if !opened.contains(&db) {
            store.open_db(db)?;
            opened.push(db);
        }
        Ok(())
    }

    /// Positional read that maps reading past the end of the file - a
    /// truncated tail - to `None`.
    fn read_or_tail(&self, idx: usize, offset: u64, len: usize) -> CoreResult<Option<Vec<u8>>> {
        match self.files[idx].read_at(offset, len) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::ReadPastEnd { .. }) => {
                warn!(file = idx, offset, len, "truncated tail during physical redo");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
