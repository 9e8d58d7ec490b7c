//! Crash-recovery harness.
//!
//! Scripts a workload against a real (temp-directory) journal, simulates
//! a crash, and recovers into fresh collaborator doubles. Two crash
//! shapes are supported:
//!
//! - **Clean cut**: the workload finishes and the journal's buffers are
//!   flushed, so everything the workload staged is on disk - the state a
//!   crash leaves behind after the last flush.
//! - **Mid-changeset fault**: a fault armed at one of the changeset
//!   append's checkpoints aborts the workload; buffered bytes are lost,
//!   exactly as a crash at that point would lose them.

use crate::fixtures::{JournalFixture, MemoryPageDevice, MemoryStore};
use quilldb_core::{CoreResult, EnvConfig, Journal, TransactionManager};

/// The three fault checkpoints inside a changeset append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetCrashPoint {
    /// After the pages are staged, before the entry header is patched.
    BeforeHeaderPatch,
    /// After the patch, before the buffer reaches the file.
    BeforeFlush,
    /// After the flush (and fsync, when enabled).
    AfterFlush,
}

impl ChangesetCrashPoint {
    /// Index of the checkpoint, as armed via
    /// [`Journal::arm_changeset_fault`].
    #[must_use]
    pub fn checkpoint(self) -> u32 {
        match self {
            Self::BeforeHeaderPatch => 0,
            Self::BeforeFlush => 1,
            Self::AfterFlush => 2,
        }
    }
}

/// Drives create → workload → crash → reopen → recover cycles.
#[derive(Debug)]
pub struct RecoveryHarness {
    fixture: JournalFixture,
    /// The page device recovery writes changesets through.
    pub device: MemoryPageDevice,
    /// The store recovery replays logical operations into.
    pub store: MemoryStore,
}

impl RecoveryHarness {
    /// Creates a harness, letting the caller adjust the configuration.
    #[must_use]
    pub fn new(adjust: impl FnOnce(EnvConfig) -> EnvConfig) -> Self {
        let fixture = JournalFixture::with_config(adjust);
        let page_size = fixture.config().page_size;
        Self {
            fixture,
            device: MemoryPageDevice::new(page_size),
            store: MemoryStore::new(),
        }
    }

    /// The underlying journal fixture.
    #[must_use]
    pub fn fixture(&self) -> &JournalFixture {
        &self.fixture
    }

    /// Runs `workload` against a fresh journal, then crashes.
    ///
    /// When the workload succeeds, buffered bytes are flushed to the files
    /// before the simulated crash. When it fails - e.g. through an armed
    /// changeset fault - the journal is dropped as-is and buffered bytes
    /// are lost, and the workload's error is returned for inspection.
    ///
    /// # Errors
    ///
    /// Returns the workload's error, or a creation/flush failure.
    pub fn run_to_crash<F>(&self, workload: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Journal, &mut TransactionManager) -> CoreResult<()>,
    {
        let mut journal = self.fixture.create_journal()?;
        let mut manager = TransactionManager::new();
        match workload(&mut journal, &mut manager) {
            Ok(()) => journal.close(true),
            Err(e) => Err(e),
        }
    }

    /// Reopens the journal and recovers into the harness's device and
    /// store.
    ///
    /// Returns the transaction manager recovery ran with, so tests can
    /// check the live-transaction picture and the ID watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if open or recovery fails.
    pub fn recover(&mut self) -> CoreResult<TransactionManager> {
        let mut journal = self.fixture.open_journal()?;
        let mut manager = TransactionManager::new();
        journal.recover(&mut self.device, &mut self.store, &mut manager)?;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilldb_core::{ChangesetPage, DbName, Lsn, PageDevice, Transaction};

    const PAGE: usize = 128;

    fn harness() -> RecoveryHarness {
        RecoveryHarness::new(|config| config.page_size(PAGE))
    }

    /// Stages a temporary insert and flushes it by closing over a real
    /// committed transaction, then appends a changeset that faults at
    /// `point`.
    fn crash_in_changeset(point: ChangesetCrashPoint) -> RecoveryHarness {
        let harness = harness();
        let page = vec![0x7Fu8; PAGE];

        let result = harness.run_to_crash(|journal, manager| {
            let mut temp = Transaction::temporary();
            journal.append_insert(
                DbName::new(1),
                &mut temp,
                &[0x0A],
                &[0x0B],
                0,
                Lsn::new(1),
            )?;

            // A committed transaction flushes the buffer, making the
            // insert durable before the changeset is attempted.
            let id = manager.begin(None);
            journal.append_txn_begin(manager.get_mut(id).unwrap(), Lsn::new(2))?;
            journal.append_txn_commit(manager.get_mut(id).unwrap(), Lsn::new(3))?;
            journal.transaction_flushed(manager.get(id).unwrap());

            journal.arm_changeset_fault(point.checkpoint());
            journal
                .append_changeset(
                    &[ChangesetPage {
                        address: 0,
                        data: &page,
                    }],
                    0,
                    Lsn::new(4),
                )
                .map(|_| ())
        });
        assert!(result.is_err(), "the armed fault must abort the workload");
        harness
    }

    #[test]
    fn fault_before_patch_loses_the_changeset() {
        let mut harness = crash_in_changeset(ChangesetCrashPoint::BeforeHeaderPatch);
        harness.recover().unwrap();

        // No durable changeset: the insert is replayed logically.
        assert_eq!(harness.store.get(DbName::new(1), &[0x0A]), Some(&[0x0B][..]));
        assert_eq!(harness.device.file_size().unwrap(), 0);
    }

    #[test]
    fn fault_before_flush_loses_the_changeset() {
        let mut harness = crash_in_changeset(ChangesetCrashPoint::BeforeFlush);
        harness.recover().unwrap();

        assert_eq!(harness.store.get(DbName::new(1), &[0x0A]), Some(&[0x0B][..]));
        assert_eq!(harness.device.file_size().unwrap(), 0);
    }

    #[test]
    fn fault_after_flush_keeps_the_changeset() {
        let mut harness = crash_in_changeset(ChangesetCrashPoint::AfterFlush);
        harness.recover().unwrap();

        // The changeset at LSN 4 is durable: phase 1 restores the page and
        // the insert at LSN 1 is skipped as already covered.
        assert_eq!(harness.device.page(0), &[0x7Fu8; PAGE][..]);
        assert!(harness.store.is_empty(DbName::new(1)));
    }

    #[test]
    fn clean_crash_preserves_flushed_bytes_only() {
        let harness = harness();
        harness
            .run_to_crash(|journal, _| {
                let mut temp = Transaction::temporary();
                journal.append_insert(DbName::new(1), &mut temp, b"k", b"v", 0, Lsn::new(1))
            })
            .unwrap();

        // close(keep_files) flushed the buffered insert.
        assert!(harness.fixture().journal_file_size(0) > 0);
    }
}
