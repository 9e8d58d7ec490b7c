//! Environment configuration consumed by the journal.

use crate::compress::CompressionAlgorithm;
use std::path::{Path, PathBuf};

/// Default per-file transaction threshold that triggers a rotation attempt.
pub(crate) const DEFAULT_SWITCH_THRESHOLD: u32 = 32;

/// Default page size of the page store, in bytes.
const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Configuration for an environment and its journal.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Path of the environment's database file. The journal files derive
    /// their names from it.
    pub filename: PathBuf,

    /// Optional dedicated directory for the journal files. When set, the
    /// journal files are `<log_directory>/<basename-of-filename>.jrn{0,1}`.
    pub log_directory: Option<PathBuf>,

    /// Per-file count of open + closed transactions after which the journal
    /// tries to switch files. Zero selects the built-in default.
    pub journal_switch_threshold: u32,

    /// Compression applied to journal payloads. Disabled by default.
    pub compression: CompressionAlgorithm,

    /// Page size of the page store, in bytes. Changeset page records carry
    /// exactly this many bytes when stored raw.
    pub page_size: usize,

    /// Whether commits and changesets fsync the journal file.
    pub fsync_on_commit: bool,

    /// Whether transactions are enabled. Disables phase-2 recovery when
    /// false.
    pub enable_transactions: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from("quill.db"),
            log_directory: None,
            journal_switch_threshold: 0,
            compression: CompressionAlgorithm::None,
            page_size: DEFAULT_PAGE_SIZE,
            fsync_on_commit: false,
            enable_transactions: true,
        }
    }
}

impl EnvConfig {
    /// Creates a configuration for the given database file with default
    /// values.
    #[must_use]
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    /// Sets the dedicated journal directory.
    #[must_use]
    pub fn log_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_directory = Some(dir.into());
        self
    }

    /// Sets the rotation threshold (zero selects the default).
    #[must_use]
    pub const fn journal_switch_threshold(mut self, threshold: u32) -> Self {
        self.journal_switch_threshold = threshold;
        self
    }

    /// Selects the payload compression algorithm.
    #[must_use]
    pub const fn compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compression = algorithm;
        self
    }

    /// Sets the page size of the page store.
    #[must_use]
    pub const fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets whether commits and changesets fsync the journal file.
    #[must_use]
    pub const fn fsync_on_commit(mut self, value: bool) -> Self {
        self.fsync_on_commit = value;
        self
    }

    /// Sets whether transactions are enabled.
    #[must_use]
    pub const fn enable_transactions(mut self, value: bool) -> Self {
        self.enable_transactions = value;
        self
    }

    /// Returns the effective rotation threshold.
    #[must_use]
    pub(crate) fn effective_switch_threshold(&self) -> u32 {
        if self.journal_switch_threshold == 0 {
            DEFAULT_SWITCH_THRESHOLD
        } else {
            self.journal_switch_threshold
        }
    }

    /// Computes the path of journal file `index` (0 or 1).
    ///
    /// Without a log directory this is `<filename>.jrn<index>`; with one it
    /// is `<log_directory>/<basename>.jrn<index>`.
    #[must_use]
    pub fn journal_path(&self, index: usize) -> PathBuf {
        debug_assert!(index < 2, "journal file index out of range");

        let base: &Path = match &self.log_directory {
            None => self.filename.as_path(),
            Some(_) => Path::new(
                self.filename
                    .file_name()
                    .unwrap_or(self.filename.as_os_str()),
            ),
        };

        let mut name = base.as_os_str().to_os_string();
        name.push(if index == 0 { ".jrn0" } else { ".jrn1" });

        match &self.log_directory {
            None => PathBuf::from(name),
            Some(dir) => dir.join(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_applies_when_zero() {
        let config = EnvConfig::new("test.db");
        assert_eq!(config.journal_switch_threshold, 0);
        assert_eq!(config.effective_switch_threshold(), DEFAULT_SWITCH_THRESHOLD);
    }

    #[test]
    fn explicit_threshold_wins() {
        let config = EnvConfig::new("test.db").journal_switch_threshold(2);
        assert_eq!(config.effective_switch_threshold(), 2);
    }

    #[test]
    fn journal_path_next_to_database() {
        let config = EnvConfig::new("/data/test.db");
        assert_eq!(config.journal_path(0), PathBuf::from("/data/test.db.jrn0"));
        assert_eq!(config.journal_path(1), PathBuf::from("/data/test.db.jrn1"));
    }

    #[test]
    fn journal_path_honors_log_directory() {
        let config = EnvConfig::new("/data/test.db").log_directory("/logs");
        assert_eq!(config.journal_path(0), PathBuf::from("/logs/test.db.jrn0"));
        assert_eq!(config.journal_path(1), PathBuf::from("/logs/test.db.jrn1"));
    }

    #[test]
    fn builder_pattern() {
        let config = EnvConfig::new("x.db")
            .fsync_on_commit(true)
            .page_size(4096)
            .enable_transactions(false);

        assert!(config.fsync_on_commit);
        assert_eq!(config.page_size, 4096);
        assert!(!config.enable_transactions);
    }
}
