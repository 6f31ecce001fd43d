// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Backend transactions for the in-memory relational engine, using MVCC
// (Multi-Version Concurrency Control):
// - State Pattern: Active, Committed, Aborted
// - Copy-on-Write snapshots over persistent sets
//
// ============================================================================

pub mod manager;
pub mod state;

pub use manager::{TransactionManager, TransactionStats};
pub use state::{Snapshot, Transaction, TransactionId, TransactionState};
