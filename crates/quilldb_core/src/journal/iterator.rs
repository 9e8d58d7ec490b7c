//! Two-file recovery cursor.
//!
//! Recovery reads both journal files in chronological order: the older
//! file first, then the other. Rotation guarantees that every entry of the
//! older file precedes every entry of the newer one, so file order within
//! each file plus the right starting file yields global LSN order.
//!
//! A truncated tail (short read or an entry with a null LSN) terminates
//! the scan without an error: that is the normal shape of a crash, and
//! everything before the tail is still replayed.

use crate::error::CoreResult;
use crate::journal::entry::{EntryHeader, ENTRY_HEADER_SIZE};
use crate::journal::Journal;
use tracing::warn;

/// Cursor over both journal files.
///
/// `fdstart` is the file the scan began with (the older file), `fdidx`
/// the file currently being read, and `offset` the byte position within
/// it. Obtained from [`Journal::cursor`], advanced by
/// [`Journal::read_entry`].
#[derive(Debug, Clone, Copy)]
pub struct JournalCursor {
    pub(crate) fdstart: usize,
    pub(crate) fdidx: usize,
    pub(crate) offset: u64,
}

impl Journal {
    /// Returns a cursor positioned at the start of the older file.
    ///
    /// The older file is the one whose first entry carries the smaller
    /// LSN; an empty or unreadable file counts as newest. Ties go to
    /// file 1.
    #[must_use]
    pub fn cursor(&self) -> JournalCursor {
        let start = self.older_file();
        JournalCursor {
            fdstart: start,
            fdidx: start,
            offset: 0,
        }
    }

    /// Index of the chronologically older journal file.
    pub(crate) fn older_file(&self) -> usize {
        if self.first_lsn(0) < self.first_lsn(1) {
            0
        } else {
            1
        }
    }

    /// LSN of the first entry of file `idx`, or `u64::MAX` when the file
    /// is empty, unreadable, or starts with a null LSN.
    fn first_lsn(&self, idx: usize) -> u64 {
        match self.files[idx].read_at(0, ENTRY_HEADER_SIZE) {
            Ok(bytes) => match EntryHeader::decode(&bytes) {
                Ok(header) if !header.lsn.is_null() => header.lsn.as_u64(),
                _ => u64::MAX,
            },
            Err(_) => u64::MAX,
        }
    }

    /// Reads the entry under the cursor and advances past it.
    ///
    /// Returns the entry header and its payload bytes. At the end of the
    /// first file the cursor moves to the second; at the end of the log -
    /// including a truncated tail - a header with a null LSN and an empty
    /// payload is returned.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures other than reading past the end
    /// of a file (which is a truncated tail, not an error).
    pub fn read_entry(&self, cursor: &mut JournalCursor) -> CoreResult<(EntryHeader, Vec<u8>)> {
        let end_of_log = (EntryHeader::end_of_log(), Vec::new());

        let mut filesize = self.files[cursor.fdidx].size()?;

        // End of the current file: move to the second file once, then stop.
        if cursor.offset >= filesize {
            if cursor.fdidx != cursor.fdstart {
                return Ok(end_of_log);
            }
            cursor.fdidx = 1 - cursor.fdidx;
            cursor.offset = 0;
            filesize = self.files[cursor.fdidx].size()?;
        }

        if cursor.offset >= filesize {
            return Ok(end_of_log);
        }

        let header_bytes = match self.files[cursor.fdidx].read_at(cursor.offset, ENTRY_HEADER_SIZE)
        {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(
                    file = cursor.fdidx,
                    offset = cursor.offset,
                    "truncated entry header, stopping recovery scan"
                );
                return Ok(end_of_log);
            }
        };
        let header = EntryHeader::decode(&header_bytes)?;
        cursor.offset += ENTRY_HEADER_SIZE as u64;

        if header.followup_size == 0 {
            return Ok((header, Vec::new()));
        }

        match self
            .files[cursor.fdidx]
            .read_at(cursor.offset, header.followup_size as usize)
        {
            Ok(payload) => {
                cursor.offset += u64::from(header.followup_size);
                Ok((header, payload))
            }
            Err(_) => {
                warn!(
                    file = cursor.fdidx,
                    offset = cursor.offset,
                    "truncated entry payload, stopping recovery scan"
                );
                Ok(end_of_log)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionAlgorithm;
    use crate::config::EnvConfig;
    use crate::journal::entry::{EntryKind, InsertHeader};
    use crate::journal::Journal;
    use crate::transaction::{Transaction, TransactionManager};
    use crate::types::{DbName, Lsn};
    use quilldb_storage::InMemoryBackend;

    fn memory_journal(config: EnvConfig) -> Journal {
        Journal::with_backends(
            config,
            [
                Box::new(InMemoryBackend::new()),
                Box::new(InMemoryBackend::new()),
            ],
        )
    }

    fn collect_lsns(journal: &Journal) -> Vec<u64> {
        let mut cursor = journal.cursor();
        let mut lsns = Vec::new();
        loop {
            let (header, _) = journal.read_entry(&mut cursor).unwrap();
            if header.lsn.is_null() {
                break;
            }
            lsns.push(header.lsn.as_u64());
        }
        lsns
    }

    #[test]
    fn empty_journal_yields_end_of_log() {
        let journal = memory_journal(EnvConfig::new("t.db"));
        let mut cursor = journal.cursor();
        let (header, payload) = journal.read_entry(&mut cursor).unwrap();
        assert!(header.lsn.is_null());
        assert!(payload.is_empty());
    }

    #[test]
    fn entries_come_back_in_lsn_order_across_files() {
        // Threshold 1 pushes each new transaction onto the other file, so
        // the log spans both files. The third transaction recycles file 0,
        // discarding LSNs 1-2.
        let config = EnvConfig::new("t.db").journal_switch_threshold(1);
        let mut journal = memory_journal(config);
        let mut mgr = TransactionManager::new();

        let mut lsn = 0u64;
        for _ in 0..3 {
            let id = mgr.begin(None);
            lsn += 1;
            journal
                .append_txn_begin(mgr.get_mut(id).unwrap(), Lsn::new(lsn))
                .unwrap();
            lsn += 1;
            journal
                .append_txn_commit(mgr.get_mut(id).unwrap(), Lsn::new(lsn))
                .unwrap();
            journal.transaction_flushed(mgr.get(id).unwrap());
        }
        journal.close(true).unwrap();

        let lsns = collect_lsns(&journal);
        assert_eq!(lsns, vec![3, 4, 5, 6]);
    }

    #[test]
    fn begin_entry_carries_the_name() {
        let mut journal = memory_journal(EnvConfig::new("t.db"));
        let mut mgr = TransactionManager::new();

        let id = mgr.begin(Some("shipments"));
        journal
            .append_txn_begin(mgr.get_mut(id).unwrap(), Lsn::new(1))
            .unwrap();
        journal.close(true).unwrap();

        let mut cursor = journal.cursor();
        let (header, payload) = journal.read_entry(&mut cursor).unwrap();
        assert_eq!(header.entry_kind(), Some(EntryKind::TxnBegin));
        assert_eq!(header.txn_id, id);
        assert_eq!(payload, b"shipments");
    }

    #[test]
    fn insert_roundtrip_raw_and_compressed_regions() {
        // A compressible record next to an incompressible key exercises
        // the mixed raw/compressed form.
        let config = EnvConfig::new("t.db").compression(CompressionAlgorithm::Lz4);
        let mut journal = memory_journal(config);
        let mut txn = Transaction::temporary();

        let key = [1u8, 2, 3];
        let record = vec![0x5Au8; 2048];
        journal
            .append_insert(DbName::new(4), &mut txn, &key, &record, 7, Lsn::new(1))
            .unwrap();
        journal.close(true).unwrap();

        let mut cursor = journal.cursor();
        let (header, payload) = journal.read_entry(&mut cursor).unwrap();
        assert_eq!(header.entry_kind(), Some(EntryKind::Insert));
        assert_eq!(header.dbname, DbName::new(4));
        assert_eq!(header.followup_size as usize, payload.len());

        let insert = InsertHeader::decode(&payload).unwrap();
        assert_eq!(insert.flags, 7);
        assert_eq!(insert.compressed_key_size, 0, "tiny key stays raw");
        assert!(insert.compressed_record_size > 0, "record compresses");

        let key_start = InsertHeader::SIZE;
        let key_end = key_start + insert.stored_key_len();
        assert_eq!(&payload[key_start..key_end], &key);

        let mut compressor = crate::compress::Compressor::create(CompressionAlgorithm::Lz4)
            .unwrap();
        let decompressed = compressor
            .decompress(&payload[key_end..], record.len())
            .unwrap();
        assert_eq!(decompressed, &record[..]);
    }

    #[test]
    fn insert_roundtrip_with_both_regions_compressed() {
        let config = EnvConfig::new("t.db").compression(CompressionAlgorithm::Lz4);
        let mut journal = memory_journal(config);
        let mut txn = Transaction::temporary();

        let key = vec![0x11u8; 512];
        let record = vec![0x22u8; 2048];
        journal
            .append_insert(DbName::new(2), &mut txn, &key, &record, 0, Lsn::new(1))
            .unwrap();
        journal.close(true).unwrap();

        let mut cursor = journal.cursor();
        let (header, payload) = journal.read_entry(&mut cursor).unwrap();
        let insert = InsertHeader::decode(&payload).unwrap();
        assert!(insert.compressed_key_size > 0);
        assert!(insert.compressed_record_size > 0);
        assert_eq!(header.followup_size as usize, payload.len());

        let key_start = InsertHeader::SIZE;
        let key_end = key_start + insert.stored_key_len();
        let mut compressor =
            crate::compress::Compressor::create(CompressionAlgorithm::Lz4).unwrap();
        let got_key = compressor
            .decompress(&payload[key_start..key_end], key.len())
            .unwrap()
            .to_vec();
        let got_record = compressor
            .decompress(&payload[key_end..], record.len())
            .unwrap()
            .to_vec();
        assert_eq!(got_key, key);
        assert_eq!(got_record, record);
    }

    #[test]
    fn insert_roundtrip_without_compressor() {
        let mut journal = memory_journal(EnvConfig::new("t.db"));
        let mut txn = Transaction::temporary();

        journal
            .append_insert(DbName::new(1), &mut txn, b"key", b"record", 0, Lsn::new(1))
            .unwrap();
        journal.close(true).unwrap();

        let mut cursor = journal.cursor();
        let (header, payload) = journal.read_entry(&mut cursor).unwrap();
        let insert = InsertHeader::decode(&payload).unwrap();
        assert_eq!(insert.compressed_key_size, 0);
        assert_eq!(insert.compressed_record_size, 0);
        assert_eq!(&payload[InsertHeader::SIZE..InsertHeader::SIZE + 3], b"key");
        assert_eq!(&payload[InsertHeader::SIZE + 3..], b"record");
    }

    #[test]
    fn truncated_header_ends_the_scan() {
        // A file holding part of an entry header: the scan must stop
        // cleanly, not error.
        let partial = vec![0xFFu8; ENTRY_HEADER_SIZE - 1];
        let journal = Journal::with_backends(
            EnvConfig::new("t.db"),
            [
                Box::new(InMemoryBackend::with_data(partial)),
                Box::new(InMemoryBackend::new()),
            ],
        );

        let mut cursor = journal.cursor();
        let (header, _) = journal.read_entry(&mut cursor).unwrap();
        assert!(header.lsn.is_null());
    }

    #[test]
    fn truncated_payload_ends_the_scan() {
        let mut journal = memory_journal(EnvConfig::new("t.db"));
        let mut txn = Transaction::temporary();
        journal
            .append_insert(DbName::new(1), &mut txn, b"k", b"v", 0, Lsn::new(1))
            .unwrap();
        journal.close(true).unwrap();

        // Rebuild the journal with the last byte missing.
        let mut cursor = journal.cursor();
        let full_size = journal.file_size(cursor.fdidx).unwrap();
        let bytes = journal.files[cursor.fdidx]
            .read_at(0, full_size as usize - 1)
            .unwrap();
        let truncated = Journal::with_backends(
            EnvConfig::new("t.db"),
            [
                Box::new(InMemoryBackend::with_data(bytes)),
                Box::new(InMemoryBackend::new()),
            ],
        );

        let mut cursor = truncated.cursor();
        let (header, _) = truncated.read_entry(&mut cursor).unwrap();
        assert!(header.lsn.is_null());
    }

    #[test]
    fn older_file_is_scanned_first() {
        let config = EnvConfig::new("t.db").journal_switch_threshold(1);
        let mut journal = memory_journal(config);
        let mut mgr = TransactionManager::new();

        // First transaction fills file 0, second rotates to file 1.
        for lsn in [1u64, 3] {
            let id = mgr.begin(None);
            journal
                .append_txn_begin(mgr.get_mut(id).unwrap(), Lsn::new(lsn))
                .unwrap();
            journal
                .append_txn_commit(mgr.get_mut(id).unwrap(), Lsn::new(lsn + 1))
                .unwrap();
            journal.transaction_flushed(mgr.get(id).unwrap());
        }
        journal.close(true).unwrap();

        assert_eq!(journal.older_file(), 0);
        let cursor = journal.cursor();
        assert_eq!(cursor.fdstart, 0);
        assert_eq!(collect_lsns(&journal), vec![1, 2, 3, 4]);
    }
}
