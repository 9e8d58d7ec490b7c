//! # QuillDB Core
//!
//! Write-ahead journal core for the QuillDB embedded key-value storage
//! engine.
//!
//! Every logical mutation (transaction begin/commit/abort, insert, erase)
//! and every physical page-level changeset is journaled before the
//! corresponding in-memory state becomes authoritative, so that after an
//! unclean shutdown the store can be restored to a consistent, committed
//! state.
//!
//! This crate provides:
//! - The journal append path: two-file rotation, in-memory write buffering,
//!   optional LZ4 payload compression, and fsync discipline
//! - The recovery path: physical redo of page changesets followed by
//!   logical redo of transactional operations newer than the last durable
//!   changeset
//! - A lightweight transaction manager binding transactions to journal
//!   files
//! - The collaborator seams recovery writes through ([`PageDevice`],
//!   [`ReplayStore`])

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compress;
mod config;
mod device;
mod error;
mod journal;
mod replay;
mod transaction;
mod types;

pub use compress::{CompressionAlgorithm, Compressor};
pub use config::EnvConfig;
pub use device::PageDevice;
pub use error::{CoreError, CoreResult};
pub use journal::{
    ChangesetHeader, ChangesetPage, EntryHeader, EntryKind, EraseHeader, InsertHeader, Journal,
    JournalCursor, JournalMetrics, PageHeader, ENTRY_HEADER_SIZE,
};
pub use replay::ReplayStore;
pub use transaction::{Transaction, TransactionManager, TxnState};
pub use types::{DbName, Lsn, TxnId};
