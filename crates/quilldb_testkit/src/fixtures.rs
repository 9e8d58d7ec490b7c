//! Test fixtures: collaborator doubles and temp-directory journals.

use quilldb_core::{CoreError, CoreResult, DbName, EnvConfig, Journal, PageDevice, ReplayStore};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tempfile::TempDir;

/// A flat in-memory page device.
///
/// Models the page store as one contiguous byte range. `write_page`
/// overwrites a page image in place and may extend the device by exactly
/// one page at its end, matching the device contract physical redo relies
/// on.
#[derive(Debug)]
pub struct MemoryPageDevice {
    bytes: Vec<u8>,
    page_size: usize,
    last_blob_page: u64,
    reload_count: u32,
}

impl MemoryPageDevice {
    /// Creates an empty device with the given page size.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            bytes: Vec::new(),
            page_size,
            last_blob_page: 0,
            reload_count: 0,
        }
    }

    /// Returns the page image at `address`.
    ///
    /// # Panics
    ///
    /// Panics when the address lies outside the device; tests want the
    /// loud failure.
    #[must_use]
    pub fn page(&self, address: u64) -> &[u8] {
        let start = address as usize;
        &self.bytes[start..start + self.page_size]
    }

    /// The last blob page ID recorded by a replayed changeset.
    #[must_use]
    pub fn last_blob_page(&self) -> u64 {
        self.last_blob_page
    }

    /// How often the post-redo state reload hook ran.
    #[must_use]
    pub fn reload_count(&self) -> u32 {
        self.reload_count
    }
}

impl PageDevice for MemoryPageDevice {
    fn file_size(&self) -> CoreResult<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> CoreResult<()> {
        self.bytes.resize(new_size as usize, 0);
        Ok(())
    }

    fn write_page(&mut self, address: u64, data: &[u8]) -> CoreResult<()> {
        let address = address as usize;
        if address == self.bytes.len() {
            self.bytes.extend_from_slice(data);
            return Ok(());
        }
        if address + data.len() > self.bytes.len() {
            return Err(CoreError::invalid_operation(format!(
                "page write at {address} past device end {}",
                self.bytes.len()
            )));
        }
        self.bytes[address..address + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn set_last_blob_page(&mut self, page_id: u64) -> CoreResult<()> {
        self.last_blob_page = page_id;
        Ok(())
    }

    fn reload_state(&mut self) -> CoreResult<()> {
        self.reload_count += 1;
        Ok(())
    }
}

/// A replay store over per-database ordered maps.
///
/// Open/close calls are recorded for assertions but do not gate the
/// operations: like a real store, the data outlives a replay handle.
#[derive(Debug, Default)]
pub struct MemoryStore {
    dbs: BTreeMap<DbName, BTreeMap<Vec<u8>, Vec<u8>>>,
    open_log: Vec<DbName>,
    close_log: Vec<DbName>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a record.
    #[must_use]
    pub fn get(&self, db: DbName, key: &[u8]) -> Option<&[u8]> {
        self.dbs.get(&db)?.get(key).map(Vec::as_slice)
    }

    /// Number of records in database `db`.
    #[must_use]
    pub fn len(&self, db: DbName) -> usize {
        self.dbs.get(&db).map_or(0, BTreeMap::len)
    }

    /// Returns true when database `db` holds no records.
    #[must_use]
    pub fn is_empty(&self, db: DbName) -> bool {
        self.len(db) == 0
    }

    /// Databases opened during replay, in order.
    #[must_use]
    pub fn open_log(&self) -> &[DbName] {
        &self.open_log
    }

    /// Databases closed at replay teardown, in order.
    #[must_use]
    pub fn close_log(&self) -> &[DbName] {
        &self.close_log
    }
}

impl ReplayStore for MemoryStore {
    fn open_db(&mut self, name: DbName) -> CoreResult<()> {
        self.open_log.push(name);
        self.dbs.entry(name).or_default();
        Ok(())
    }

    fn close_db(&mut self, name: DbName) -> CoreResult<()> {
        self.close_log.push(name);
        Ok(())
    }

    fn insert(&mut self, name: DbName, key: &[u8], record: &[u8], _flags: u32) -> CoreResult<()> {
        self.dbs
            .entry(name)
            .or_default()
            .insert(key.to_vec(), record.to_vec());
        Ok(())
    }

    fn erase(
        &mut self,
        name: DbName,
        key: &[u8],
        _flags: u32,
        _duplicate_index: u32,
    ) -> CoreResult<()> {
        self.dbs
            .get_mut(&name)
            .and_then(|db| db.remove(key))
            .map(|_| ())
            .ok_or(CoreError::KeyNotFound)
    }
}

/// A journal living in a fresh temp directory.
///
/// Keeps the directory alive for the fixture's lifetime so a journal can
/// be created, "crashed", and reopened over the same files.
#[derive(Debug)]
pub struct JournalFixture {
    _dir: TempDir,
    config: EnvConfig,
}

impl JournalFixture {
    /// Creates a fixture with a default configuration.
    ///
    /// # Panics
    ///
    /// Panics when the temp directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates a fixture, letting the caller adjust the configuration.
    ///
    /// # Panics
    ///
    /// Panics when the temp directory cannot be created.
    #[must_use]
    pub fn with_config(adjust: impl FnOnce(EnvConfig) -> EnvConfig) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = adjust(EnvConfig::new(dir.path().join("quill.db")));
        Self { _dir: dir, config }
    }

    /// The fixture's configuration.
    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Creates a fresh journal (both files empty).
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be created.
    pub fn create_journal(&self) -> CoreResult<Journal> {
        Journal::create(self.config.clone())
    }

    /// Reopens the journal over the existing files, as an environment does
    /// before recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened.
    pub fn open_journal(&self) -> CoreResult<Journal> {
        Journal::open(self.config.clone())
    }

    /// Path of journal file `idx`.
    #[must_use]
    pub fn journal_path(&self, idx: usize) -> PathBuf {
        self.config.journal_path(idx)
    }

    /// Cuts journal file `idx` down to `len` bytes on disk, shaping a
    /// torn tail.
    ///
    /// # Panics
    ///
    /// Panics when the file cannot be opened or truncated.
    pub fn truncate_journal_file(&self, idx: usize, len: u64) {
        let file = OpenOptions::new()
            .write(true)
            .open(self.journal_path(idx))
            .expect("open journal file");
        file.set_len(len).expect("truncate journal file");
    }

    /// Size of journal file `idx` on disk.
    ///
    /// # Panics
    ///
    /// Panics when the file metadata cannot be read.
    #[must_use]
    pub fn journal_file_size(&self, idx: usize) -> u64 {
        std::fs::metadata(self.journal_path(idx))
            .expect("journal file metadata")
            .len()
    }
}

impl Default for JournalFixture {
    fn default() -> Self {
        Self::new()
    }
}
