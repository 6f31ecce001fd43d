// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Snapshot, Transaction, TransactionId, TransactionState};
use crate::connection::IsolationLevel;
use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry of backend transactions.
///
/// The registry sits behind a synchronous lock with short critical sections so that a
/// connection dropped mid-transaction can abort synchronously from `Drop`.
pub struct TransactionManager {
    next_id: AtomicU64,
    registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    transactions: HashMap<TransactionId, Transaction>,
    active: im::HashSet<u64>,
    aborted: im::HashSet<u64>,
    committed_count: u64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            // 0 is reserved for snapshot-only readers
            next_id: AtomicU64::new(1),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<TransactionId> {
        let mut registry = self.registry.write()?;
        let txn_id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        registry.active.insert(txn_id.0);
        let snapshot = Snapshot {
            tx_id: txn_id.0,
            active: registry.active.clone(),
            aborted: registry.aborted.clone(),
            max_tx_id: txn_id.0 + 1,
        };
        registry
            .transactions
            .insert(txn_id, Transaction::new(txn_id, isolation, snapshot));

        Ok(txn_id)
    }

    /// Snapshot used by a statement of `txn_id`.
    ///
    /// Read committed takes a fresh view per statement; the stricter levels reuse the
    /// snapshot taken at `begin`.
    pub fn statement_snapshot(&self, txn_id: TransactionId) -> Result<Snapshot> {
        let registry = self.registry.read()?;
        let txn = registry
            .transactions
            .get(&txn_id)
            .ok_or_else(|| DbError::ExecutionError(format!("Transaction {} not found", txn_id)))?;

        if txn.isolation() == IsolationLevel::ReadCommitted {
            Ok(self.current_snapshot(&registry, txn_id.0))
        } else {
            Ok(txn.snapshot().clone())
        }
    }

    /// Latest view for `txn_id`, used to validate writes against concurrent commits.
    pub fn write_snapshot(&self, txn_id: TransactionId) -> Result<Snapshot> {
        let registry = self.registry.read()?;
        Ok(self.current_snapshot(&registry, txn_id.0))
    }

    /// Snapshot for a reader outside any transaction
    pub fn read_snapshot(&self) -> Result<Snapshot> {
        let registry = self.registry.read()?;
        Ok(self.current_snapshot(&registry, 0))
    }

    fn current_snapshot(&self, registry: &Registry, tx_id: u64) -> Snapshot {
        Snapshot {
            tx_id,
            active: registry.active.clone(),
            aborted: registry.aborted.clone(),
            max_tx_id: self.next_id.load(Ordering::SeqCst),
        }
    }

    pub fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut registry = self.registry.write()?;
        let mut transaction = registry
            .transactions
            .remove(&txn_id)
            .ok_or_else(|| DbError::ExecutionError(format!("Transaction {} not found", txn_id)))?;

        transaction.mark_committed()?;
        registry.active.remove(&txn_id.0);
        registry.committed_count += 1;
        Ok(())
    }

    pub fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let mut registry = self.registry.write()?;
        if let Some(mut transaction) = registry.transactions.remove(&txn_id) {
            transaction.mark_aborted()?;
            registry.active.remove(&txn_id.0);
            registry.aborted.insert(txn_id.0);
        }
        Ok(())
    }

    pub fn state(&self, txn_id: TransactionId) -> Result<TransactionState> {
        let registry = self.registry.read()?;
        if let Some(txn) = registry.transactions.get(&txn_id) {
            return Ok(txn.state());
        }
        if registry.aborted.contains(&txn_id.0) {
            return Ok(TransactionState::Aborted);
        }
        if txn_id.0 < self.next_id.load(Ordering::SeqCst) {
            return Ok(TransactionState::Committed);
        }
        Err(DbError::ExecutionError(format!("Transaction {} not found", txn_id)))
    }

    /// Snapshot whose `tx_id` bounds what vacuum may purge.
    ///
    /// A deleter older than every running transaction, and older than anything those
    /// transactions still saw as in flight when they began, is invisible to all readers.
    pub fn vacuum_horizon(&self) -> Result<Snapshot> {
        let registry = self.registry.read()?;
        let next = self.next_id.load(Ordering::SeqCst);
        let oldest = registry
            .transactions
            .values()
            .flat_map(|txn| {
                std::iter::once(txn.id().0).chain(txn.snapshot().active.iter().copied())
            })
            .min()
            .unwrap_or(next);

        let mut horizon = self.current_snapshot(&registry, 0);
        horizon.tx_id = oldest;
        Ok(horizon)
    }

    /// Drop aborted ids whose row versions have been purged
    pub fn forget_aborted(&self, ids: &[u64]) -> Result<()> {
        let mut registry = self.registry.write()?;
        for id in ids {
            registry.aborted.remove(id);
        }
        Ok(())
    }

    pub fn info(&self) -> Result<TransactionStats> {
        let registry = self.registry.read()?;
        Ok(TransactionStats {
            active: registry.active.len(),
            aborted: registry.aborted.len(),
            committed: registry.committed_count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    pub active: usize,
    pub aborted: usize,
    pub committed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_makes_writes_visible_to_later_snapshots() {
        let manager = TransactionManager::new();
        let writer = manager.begin(IsolationLevel::ReadCommitted).unwrap();

        let before = manager.read_snapshot().unwrap();
        assert!(!before.is_committed(writer.0));

        manager.commit(writer).unwrap();
        let after = manager.read_snapshot().unwrap();
        assert!(after.is_committed(writer.0));
        assert_eq!(manager.state(writer).unwrap(), TransactionState::Committed);
    }

    #[test]
    fn test_repeatable_read_keeps_begin_snapshot() {
        let manager = TransactionManager::new();
        let reader = manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let writer = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.commit(writer).unwrap();

        let snap = manager.statement_snapshot(reader).unwrap();
        assert!(!snap.is_committed(writer.0));

        let fresh = manager.write_snapshot(reader).unwrap();
        assert!(fresh.is_committed(writer.0));
    }

    #[test]
    fn test_rollback_marks_aborted() {
        let manager = TransactionManager::new();
        let txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.rollback(txn).unwrap();

        assert_eq!(manager.state(txn).unwrap(), TransactionState::Aborted);
        assert!(manager.read_snapshot().unwrap().is_aborted(txn.0));
        assert!(manager.commit(txn).is_err());

        let stats = manager.info().unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.aborted, 1);
    }
}
