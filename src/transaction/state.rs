// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each backend transaction moves through Active -> Committed/Aborted.
// Visibility of row versions is decided against a Snapshot of the
// transaction registry (MVCC):
// - xmin: transaction that created a row version
// - xmax: transaction that deleted or superseded it
//
// ============================================================================

use crate::connection::IsolationLevel;
use std::time::{Duration, Instant};

/// Unique identifier for a backend transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Point-in-time view of which transactions are in flight or aborted.
///
/// Cloning is O(1): the sets are persistent `im` structures shared with the registry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: u64,
    pub active: im::HashSet<u64>,
    pub aborted: im::HashSet<u64>,
    pub max_tx_id: u64,
}

impl Snapshot {
    pub fn is_committed(&self, tx_id: u64) -> bool {
        tx_id < self.max_tx_id && !self.active.contains(&tx_id) && !self.aborted.contains(&tx_id)
    }

    pub fn is_aborted(&self, tx_id: u64) -> bool {
        self.aborted.contains(&tx_id)
    }

    /// Whether `tx_id` belongs to a transaction other than ours that has not finished.
    pub fn is_in_flight(&self, tx_id: u64) -> bool {
        tx_id != self.tx_id && !self.is_committed(tx_id) && !self.is_aborted(tx_id)
    }

    /// MVCC visibility of a row version created by `xmin` and removed by `xmax`.
    pub fn is_visible(&self, xmin: u64, xmax: Option<u64>) -> bool {
        if xmin == self.tx_id {
            return xmax != Some(self.tx_id);
        }

        if !self.is_committed(xmin) {
            return false;
        }

        match xmax {
            Some(xmax) if xmax == self.tx_id => false,
            Some(xmax) => !self.is_committed(xmax),
            None => true,
        }
    }
}

/// A backend transaction
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    isolation: IsolationLevel,
    snapshot: Snapshot,
    start_time: Instant,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation: IsolationLevel, snapshot: Snapshot) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            isolation,
            snapshot,
            start_time: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Snapshot taken when the transaction began
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn mark_committed(&mut self) -> crate::core::Result<()> {
        self.transition(TransactionState::Committed)
    }

    pub fn mark_aborted(&mut self) -> crate::core::Result<()> {
        self.transition(TransactionState::Aborted)
    }

    fn transition(&mut self, next: TransactionState) -> crate::core::Result<()> {
        if !self.state.is_active() {
            return Err(crate::core::DbError::ExecutionError(format!(
                "Cannot move transaction {} from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}
