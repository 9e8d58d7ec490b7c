//! # QuillDB Storage
//!
//! Byte-store backends for the QuillDB journal.
//!
//! This crate provides the lowest-level storage abstraction underneath the
//! journal's file pair. Backends are **opaque byte stores** - they know
//! nothing about journal entries, changesets, or transactions. The journal
//! owns all format interpretation.
//!
//! ## Design Principles
//!
//! - Backends expose exactly what the journal needs: positional reads for
//!   recovery, appends for the write buffer, truncation for file recycling,
//!   and an fsync barrier for durability.
//! - After `truncate(n)` the next `append` lands at offset `n`; backends
//!   with independent read/write positions must re-derive the append
//!   position from the tracked size.
//! - Backends must be `Send + Sync` so that flusher callbacks and the
//!   writer can coexist.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - persistent storage using OS file APIs
//! - [`InMemoryBackend`] - for tests and ephemeral journals
//!
//! ## Example
//!
//! ```rust
//! use quilldb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"journal bytes").unwrap();
//! let data = backend.read_at(offset, 13).unwrap();
//! assert_eq!(&data, b"journal bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
