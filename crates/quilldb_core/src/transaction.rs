//! Transactions and the transaction manager.
//!
//! The journal binds every transaction to one journal file at begin time
//! (its *log descriptor*), so that a file can be recycled as soon as no
//! transaction begun in it is still in flight. The manager keeps live
//! transactions oldest-first and owns the monotonically increasing ID
//! watermark; recovery rebinds replayed transactions to their logged IDs
//! and pushes the watermark past them.

use crate::error::{CoreError, CoreResult};
use crate::replay::ReplayStore;
use crate::types::{DbName, TxnId};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// An operation buffered on a transaction during replay.
///
/// Applied to the store in commit order by
/// [`TransactionManager::flush_committed`].
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Insert {
        db: DbName,
        key: Vec<u8>,
        record: Vec<u8>,
        flags: u32,
    },
    Erase {
        db: DbName,
        key: Vec<u8>,
        flags: u32,
        duplicate_index: u32,
    },
}

/// A transaction known to the journal.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    name: Option<String>,
    state: TxnState,
    temporary: bool,
    log_desc: Option<usize>,
    commit_order: Option<u64>,
    pending: Vec<PendingOp>,
}

impl Transaction {
    fn new(id: TxnId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            state: TxnState::Active,
            temporary: false,
            log_desc: None,
            commit_order: None,
            pending: Vec::new(),
        }
    }

    /// Creates the implicit transaction wrapping a single auto-committed
    /// operation.
    ///
    /// Temporary transactions are never registered with the manager and
    /// their begin/commit/abort markers are not journaled; only the
    /// enclosed mutation is, with [`TxnId::NONE`].
    #[must_use]
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::new(TxnId::NONE, None)
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the transaction's name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Returns true while the transaction is neither committed nor aborted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Returns true once the transaction has been committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    /// Returns true for the implicit auto-commit transaction.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Returns the journal file index this transaction is bound to.
    ///
    /// `None` until the begin marker has been journaled.
    #[must_use]
    pub fn log_desc(&self) -> Option<usize> {
        self.log_desc
    }

    pub(crate) fn set_log_desc(&mut self, idx: usize) {
        self.log_desc = Some(idx);
    }

    pub(crate) fn push_pending(&mut self, op: PendingOp) {
        self.pending.push(op);
    }
}

/// Manages the live transactions of an environment.
///
/// Live transactions are kept oldest-first. IDs are issued from a
/// watermark that only moves forward; recovery advances it past every
/// replayed transaction so post-recovery transactions never collide with
/// journaled ones.
#[derive(Debug)]
pub struct TransactionManager {
    txns: Vec<Transaction>,
    next_id: u64,
    commit_counter: u64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Creates an empty manager. The first issued ID is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            txns: Vec::new(),
            next_id: 1,
            commit_counter: 0,
        }
    }

    /// Begins a new transaction and returns its ID.
    pub fn begin(&mut self, name: Option<&str>) -> TxnId {
        let id = TxnId::new(self.next_id);
        self.next_id += 1;
        self.txns
            .push(Transaction::new(id, name.map(str::to_owned)));
        id
    }

    /// Returns the oldest live transaction, if any.
    #[must_use]
    pub fn oldest(&self) -> Option<&Transaction> {
        self.txns.first()
    }

    /// Returns the number of live transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.txns.len()
    }

    /// Returns true when no transaction is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    /// Looks up a live transaction by ID.
    #[must_use]
    pub fn get(&self, id: TxnId) -> Option<&Transaction> {
        self.txns.iter().find(|t| t.id == id)
    }

    /// Looks up a live transaction by ID, mutably.
    pub fn get_mut(&mut self, id: TxnId) -> Option<&mut Transaction> {
        self.txns.iter_mut().find(|t| t.id == id)
    }

    /// Rebinds a live transaction to a recovered ID and advances the
    /// watermark past it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if `current` is not live.
    pub fn assume_id(&mut self, current: TxnId, recovered: TxnId) -> CoreResult<()> {
        let txn = self
            .txns
            .iter_mut()
            .find(|t| t.id == current)
            .ok_or(CoreError::TransactionNotFound { id: current })?;
        txn.id = recovered;
        self.advance_watermark(recovered);
        Ok(())
    }

    /// Moves the ID watermark past `id` if it is not already there.
    pub fn advance_watermark(&mut self, id: TxnId) {
        if id.as_u64() >= self.next_id {
            self.next_id = id.as_u64() + 1;
        }
    }

    /// Aborts a live transaction, discarding its pending operations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if `id` is not live.
    pub fn abort(&mut self, id: TxnId) -> CoreResult<()> {
        let pos = self
            .txns
            .iter()
            .position(|t| t.id == id)
            .ok_or(CoreError::TransactionNotFound { id })?;
        let mut txn = self.txns.remove(pos);
        txn.state = TxnState::Aborted;
        Ok(())
    }

    /// Commits a live transaction. Its pending operations stay buffered
    /// until [`TransactionManager::flush_committed`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if `id` is not live, or
    /// [`CoreError::InvalidOperation`] if the transaction is not active.
    pub fn commit(&mut self, id: TxnId) -> CoreResult<()> {
        self.commit_counter += 1;
        let order = self.commit_counter;
        let txn = self
            .get_mut(id)
            .ok_or(CoreError::TransactionNotFound { id })?;
        if txn.state != TxnState::Active {
            return Err(CoreError::invalid_operation("transaction not active"));
        }
        txn.state = TxnState::Committed;
        txn.commit_order = Some(order);
        Ok(())
    }

    /// Returns true when the live transaction `id` has been committed.
    #[must_use]
    pub fn is_committed(&self, id: TxnId) -> bool {
        self.get(id).is_some_and(Transaction::is_committed)
    }

    /// Aborts every transaction that is still active.
    ///
    /// Used at the end of recovery: transactions with a begin marker but no
    /// commit marker in the journal are rolled back.
    pub fn abort_uncommitted(&mut self) {
        self.txns.retain_mut(|t| {
            if t.is_active() {
                t.state = TxnState::Aborted;
                false
            } else {
                true
            }
        });
    }

    /// Applies the pending operations of all committed transactions to the
    /// store, in commit order, and retires them.
    ///
    /// A [`CoreError::KeyNotFound`] from an erase is absorbed: the key may
    /// already have been removed by a changeset that was flushed before the
    /// crash.
    ///
    /// # Errors
    ///
    /// Propagates the first store error.
    pub fn flush_committed(&mut self, store: &mut dyn ReplayStore) -> CoreResult<()> {
        let mut committed: Vec<Transaction> = Vec::new();
        self.txns.retain_mut(|t| {
            if t.is_committed() {
                committed.push(Transaction {
                    id: t.id,
                    name: t.name.take(),
                    state: t.state,
                    temporary: t.temporary,
                    log_desc: t.log_desc,
                    commit_order: t.commit_order,
                    pending: std::mem::take(&mut t.pending),
                });
                false
            } else {
                true
            }
        });
        committed.sort_by_key(|t| t.commit_order);

        for txn in &committed {
            for op in &txn.pending {
                match op {
                    PendingOp::Insert {
                        db,
                        key,
                        record,
                        flags,
                    } => store.insert(*db, key, record, *flags)?,
                    PendingOp::Erase {
                        db,
                        key,
                        flags,
                        duplicate_index,
                    } => match store.erase(*db, key, *flags, *duplicate_index) {
                        Err(CoreError::KeyNotFound) => {}
                        other => other?,
                    },
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore {
        map: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl ReplayStore for MapStore {
        fn open_db(&mut self, _name: DbName) -> CoreResult<()> {
            Ok(())
        }

        fn close_db(&mut self, _name: DbName) -> CoreResult<()> {
            Ok(())
        }

        fn insert(
            &mut self,
            _name: DbName,
            key: &[u8],
            record: &[u8],
            _flags: u32,
        ) -> CoreResult<()> {
            self.map.insert(key.to_vec(), record.to_vec());
            Ok(())
        }

        fn erase(
            &mut self,
            _name: DbName,
            key: &[u8],
            _flags: u32,
            _duplicate_index: u32,
        ) -> CoreResult<()> {
            self.map
                .remove(key)
                .map(|_| ())
                .ok_or(CoreError::KeyNotFound)
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        let b = mgr.begin(None);
        assert!(a < b);
        assert_eq!(a, TxnId::new(1));
    }

    #[test]
    fn assume_id_advances_watermark() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        mgr.assume_id(a, TxnId::new(100)).unwrap();
        assert!(mgr.get(TxnId::new(100)).is_some());

        let b = mgr.begin(None);
        assert_eq!(b, TxnId::new(101));
    }

    #[test]
    fn abort_removes_transaction() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        mgr.abort(a).unwrap();
        assert!(mgr.get(a).is_none());
        assert!(mgr.is_empty());
    }

    #[test]
    fn commit_keeps_transaction_until_flush() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        mgr.commit(a).unwrap();
        assert!(mgr.is_committed(a));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn double_commit_fails() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        mgr.commit(a).unwrap();
        assert!(mgr.commit(a).is_err());
    }

    #[test]
    fn abort_uncommitted_spares_committed() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        let b = mgr.begin(None);
        mgr.commit(a).unwrap();

        mgr.abort_uncommitted();
        assert!(mgr.get(a).is_some());
        assert!(mgr.get(b).is_none());
    }

    #[test]
    fn flush_committed_applies_in_commit_order() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        let b = mgr.begin(None);

        mgr.get_mut(a).unwrap().push_pending(PendingOp::Insert {
            db: DbName::new(1),
            key: vec![1],
            record: vec![0xAA],
            flags: 0,
        });
        mgr.get_mut(b).unwrap().push_pending(PendingOp::Insert {
            db: DbName::new(1),
            key: vec![1],
            record: vec![0xBB],
            flags: 0,
        });

        // b commits before a: its write must be applied first.
        mgr.commit(b).unwrap();
        mgr.commit(a).unwrap();

        let mut store = MapStore::default();
        mgr.flush_committed(&mut store).unwrap();
        assert!(mgr.is_empty());
        assert_eq!(store.map.get(&vec![1u8]), Some(&vec![0xAA]));
    }

    #[test]
    fn flush_committed_absorbs_missing_erase_key() {
        let mut mgr = TransactionManager::new();
        let a = mgr.begin(None);
        mgr.get_mut(a).unwrap().push_pending(PendingOp::Erase {
            db: DbName::new(1),
            key: vec![9],
            flags: 0,
            duplicate_index: 0,
        });
        mgr.commit(a).unwrap();

        let mut store = MapStore::default();
        mgr.flush_committed(&mut store).unwrap();
    }

    #[test]
    fn temporary_transaction_is_flagged() {
        let txn = Transaction::temporary();
        assert!(txn.is_temporary());
        assert!(txn.id().is_none());
        assert!(txn.log_desc().is_none());
    }
}
