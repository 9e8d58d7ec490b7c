//! On-disk journal record layout.
//!
//! Every entry starts with a fixed 26-byte [`EntryHeader`] followed by
//! `followup_size` payload bytes. Insert, erase, and changeset entries put
//! a per-type header at the start of the payload, then variable data.
//! All integers are little-endian, tightly packed, no padding.
//!
//! `followup_size` is authoritative for skipping an entry during a scan;
//! readers never derive it from the type-specific fields. That is what
//! allows appenders to write a provisional header, compress the payload,
//! and patch the final sizes in place afterwards.

use crate::error::{CoreError, CoreResult};
use crate::types::{DbName, Lsn, TxnId};

/// Size of the fixed entry header:
/// lsn (8) + txn_id (8) + kind (4) + dbname (2) + followup_size (4).
pub const ENTRY_HEADER_SIZE: usize = 26;

/// Type of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryKind {
    /// A transaction began.
    TxnBegin = 1,
    /// A transaction aborted.
    TxnAbort = 2,
    /// A transaction committed.
    TxnCommit = 3,
    /// A key/record pair was inserted.
    Insert = 4,
    /// A key was erased.
    Erase = 5,
    /// A physical snapshot of dirty pages.
    Changeset = 6,
}

impl EntryKind {
    /// Converts a raw kind value to an entry kind.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::TxnBegin),
            2 => Some(Self::TxnAbort),
            3 => Some(Self::TxnCommit),
            4 => Some(Self::Insert),
            5 => Some(Self::Erase),
            6 => Some(Self::Changeset),
            _ => None,
        }
    }

    /// Returns the raw on-disk value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn check_len(buf: &[u8], need: usize, what: &str) -> CoreResult<()> {
    if buf.len() < need {
        return Err(CoreError::corruption(format!(
            "short {what}: {} bytes, need {need}",
            buf.len()
        )));
    }
    Ok(())
}

/// Fixed header at the start of every journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Sequence number; [`Lsn::NULL`] signals end of log to readers.
    pub lsn: Lsn,
    /// Owning transaction, or [`TxnId::NONE`] for changesets and temporary
    /// operations.
    pub txn_id: TxnId,
    /// Raw entry kind. Kept raw so recovery can report unknown kinds as
    /// corruption instead of failing to decode.
    pub kind: u32,
    /// Target database, or [`DbName::NONE`] for txn and changeset entries.
    pub dbname: DbName,
    /// Number of payload bytes following this header.
    pub followup_size: u32,
}

impl EntryHeader {
    /// Creates a header for the given kind with no payload.
    #[must_use]
    pub fn new(kind: EntryKind, lsn: Lsn, txn_id: TxnId) -> Self {
        Self {
            lsn,
            txn_id,
            kind: kind.as_u32(),
            dbname: DbName::NONE,
            followup_size: 0,
        }
    }

    /// The header readers synthesize at end of log.
    #[must_use]
    pub fn end_of_log() -> Self {
        Self {
            lsn: Lsn::NULL,
            txn_id: TxnId::NONE,
            kind: 0,
            dbname: DbName::NONE,
            followup_size: 0,
        }
    }

    /// Returns the decoded entry kind, or `None` for unknown values.
    #[must_use]
    pub fn entry_kind(&self) -> Option<EntryKind> {
        EntryKind::from_u32(self.kind)
    }

    /// Packs the header into its on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.lsn.as_u64().to_le_bytes());
        buf[8..16].copy_from_slice(&self.txn_id.as_u64().to_le_bytes());
        buf[16..20].copy_from_slice(&self.kind.to_le_bytes());
        buf[20..22].copy_from_slice(&self.dbname.as_u16().to_le_bytes());
        buf[22..26].copy_from_slice(&self.followup_size.to_le_bytes());
        buf
    }

    /// Unpacks a header from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `buf` is shorter than
    /// [`ENTRY_HEADER_SIZE`].
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        check_len(buf, ENTRY_HEADER_SIZE, "entry header")?;
        Ok(Self {
            lsn: Lsn::new(read_u64(buf, 0)),
            txn_id: TxnId::new(read_u64(buf, 8)),
            kind: read_u32(buf, 16),
            dbname: DbName::new(read_u16(buf, 20)),
            followup_size: read_u32(buf, 22),
        })
    }
}

/// Payload header of an insert entry, followed by key bytes then record
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertHeader {
    /// Uncompressed key length.
    pub key_size: u32,
    /// Stored key length when compressed; 0 means the key is stored raw.
    pub compressed_key_size: u32,
    /// Uncompressed record length.
    pub record_size: u32,
    /// Stored record length when compressed; 0 means raw.
    pub compressed_record_size: u32,
    /// Flags the insert was issued with, replayed verbatim.
    pub flags: u32,
}

impl InsertHeader {
    /// On-disk size of the insert header.
    pub const SIZE: usize = 20;

    /// Number of key bytes actually stored (compressed or raw).
    #[must_use]
    pub fn stored_key_len(&self) -> usize {
        if self.compressed_key_size > 0 {
            self.compressed_key_size as usize
        } else {
            self.key_size as usize
        }
    }

    /// Number of record bytes actually stored (compressed or raw).
    #[must_use]
    pub fn stored_record_len(&self) -> usize {
        if self.compressed_record_size > 0 {
            self.compressed_record_size as usize
        } else {
            self.record_size as usize
        }
    }

    /// Packs the header into its on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.key_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.compressed_key_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.record_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.compressed_record_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Unpacks a header from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `buf` is shorter than [`Self::SIZE`].
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        check_len(buf, Self::SIZE, "insert header")?;
        Ok(Self {
            key_size: read_u32(buf, 0),
            compressed_key_size: read_u32(buf, 4),
            record_size: read_u32(buf, 8),
            compressed_record_size: read_u32(buf, 12),
            flags: read_u32(buf, 16),
        })
    }
}

/// Payload header of an erase entry, followed by key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseHeader {
    /// Uncompressed key length.
    pub key_size: u32,
    /// Stored key length when compressed; 0 means raw.
    pub compressed_key_size: u32,
    /// Flags the erase was issued with, replayed verbatim.
    pub flags: u32,
    /// Index of the duplicate to erase; 0 erases all duplicates.
    pub duplicate_index: u32,
}

impl EraseHeader {
    /// On-disk size of the erase header.
    pub const SIZE: usize = 16;

    /// Number of key bytes actually stored (compressed or raw).
    #[must_use]
    pub fn stored_key_len(&self) -> usize {
        if self.compressed_key_size > 0 {
            self.compressed_key_size as usize
        } else {
            self.key_size as usize
        }
    }

    /// Packs the header into its on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.key_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.compressed_key_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.duplicate_index.to_le_bytes());
        buf
    }

    /// Unpacks a header from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `buf` is shorter than [`Self::SIZE`].
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        check_len(buf, Self::SIZE, "erase header")?;
        Ok(Self {
            key_size: read_u32(buf, 0),
            compressed_key_size: read_u32(buf, 4),
            flags: read_u32(buf, 8),
            duplicate_index: read_u32(buf, 12),
        })
    }
}

/// Payload header of a changeset entry, followed by `num_pages` page
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangesetHeader {
    /// Number of page records in this changeset.
    pub num_pages: u32,
    /// ID of the last blob page at the time of the snapshot.
    pub last_blob_page: u64,
}

impl ChangesetHeader {
    /// On-disk size of the changeset header.
    pub const SIZE: usize = 12;

    /// Packs the header into its on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.num_pages.to_le_bytes());
        buf[4..12].copy_from_slice(&self.last_blob_page.to_le_bytes());
        buf
    }

    /// Unpacks a header from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `buf` is shorter than [`Self::SIZE`].
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        check_len(buf, Self::SIZE, "changeset header")?;
        Ok(Self {
            num_pages: read_u32(buf, 0),
            last_blob_page: read_u64(buf, 4),
        })
    }
}

/// Header of one page record inside a changeset, followed by the page
/// image (compressed or raw).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Byte address of the page in the page store.
    pub address: u64,
    /// Stored image length when compressed; 0 means a raw page-sized image.
    pub compressed_size: u32,
}

impl PageHeader {
    /// On-disk size of a page record header.
    pub const SIZE: usize = 12;

    /// Packs the header into its on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..12].copy_from_slice(&self.compressed_size.to_le_bytes());
        buf
    }

    /// Unpacks a header from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `buf` is shorter than [`Self::SIZE`].
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        check_len(buf, Self::SIZE, "page header")?;
        Ok(Self {
            address: read_u64(buf, 0),
            compressed_size: read_u32(buf, 8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_roundtrip() {
        for kind in [
            EntryKind::TxnBegin,
            EntryKind::TxnAbort,
            EntryKind::TxnCommit,
            EntryKind::Insert,
            EntryKind::Erase,
            EntryKind::Changeset,
        ] {
            assert_eq!(EntryKind::from_u32(kind.as_u32()), Some(kind));
        }
        assert_eq!(EntryKind::from_u32(0), None);
        assert_eq!(EntryKind::from_u32(7), None);
    }

    #[test]
    fn entry_header_roundtrip() {
        let header = EntryHeader {
            lsn: Lsn::new(42),
            txn_id: TxnId::new(7),
            kind: EntryKind::Insert.as_u32(),
            dbname: DbName::new(3),
            followup_size: 123,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), ENTRY_HEADER_SIZE);
        assert_eq!(EntryHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn entry_header_short_buffer_is_corruption() {
        let bytes = [0u8; ENTRY_HEADER_SIZE - 1];
        assert!(EntryHeader::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_kind_survives_decode() {
        let mut header = EntryHeader::new(EntryKind::Insert, Lsn::new(1), TxnId::NONE);
        header.kind = 99;
        let decoded = EntryHeader::decode(&header.to_bytes()).unwrap();
        assert_eq!(decoded.kind, 99);
        assert_eq!(decoded.entry_kind(), None);
    }

    #[test]
    fn insert_header_roundtrip() {
        let header = InsertHeader {
            key_size: 10,
            compressed_key_size: 4,
            record_size: 100,
            compressed_record_size: 0,
            flags: 0x8000,
        };
        assert_eq!(InsertHeader::decode(&header.to_bytes()).unwrap(), header);
        assert_eq!(header.stored_key_len(), 4);
        assert_eq!(header.stored_record_len(), 100);
    }

    #[test]
    fn erase_header_roundtrip() {
        let header = EraseHeader {
            key_size: 8,
            compressed_key_size: 0,
            flags: 1,
            duplicate_index: 2,
        };
        assert_eq!(EraseHeader::decode(&header.to_bytes()).unwrap(), header);
        assert_eq!(header.stored_key_len(), 8);
    }

    #[test]
    fn changeset_and_page_header_roundtrip() {
        let cs = ChangesetHeader {
            num_pages: 3,
            last_blob_page: 0xDEAD,
        };
        assert_eq!(ChangesetHeader::decode(&cs.to_bytes()).unwrap(), cs);

        let page = PageHeader {
            address: 16384,
            compressed_size: 0,
        };
        assert_eq!(PageHeader::decode(&page.to_bytes()).unwrap(), page);
    }

    #[test]
    fn end_of_log_header_is_null() {
        let header = EntryHeader::end_of_log();
        assert!(header.lsn.is_null());
        assert_eq!(header.followup_size, 0);
    }
}
