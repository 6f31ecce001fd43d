// ============================================================================
// In-memory relational engine
// ============================================================================
//
// MVCC tables plus a transaction registry, reachable through the Connection
// trait. Writes validate against the newest committed state and report
// write-write conflicts instead of blocking.
//
// ============================================================================

use super::{Connection, ConnectionFactory, IsolationLevel, Projection, Select, Statement};
use crate::core::{DbError, Result, Row, Value};
use crate::storage::InMemoryStorage;
use crate::transaction::{TransactionId, TransactionManager, TransactionStats};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Engine {
    storage: InMemoryStorage,
    transactions: TransactionManager,
    /// Held for the whole life of a serializable transaction
    serial: Arc<Mutex<()>>,
    next_connection_id: AtomicU64,
}

/// Shared handle to an in-memory database. Cloning is cheap.
#[derive(Clone)]
pub struct InMemoryDB {
    engine: Arc<Engine>,
}

impl Default for InMemoryDB {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDB {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(Engine {
                storage: InMemoryStorage::new(),
                transactions: TransactionManager::new(),
                serial: Arc::new(Mutex::new(())),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn open_connection(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.engine.next_connection_id.fetch_add(1, Ordering::SeqCst),
            db: self.clone(),
            transaction: None,
        }
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.engine.storage.list_tables().await
    }

    pub fn transaction_stats(&self) -> Result<TransactionStats> {
        self.engine.transactions.info()
    }

    /// Purge row versions that no transaction can see. Returns the number purged.
    pub async fn vacuum(&self) -> Result<usize> {
        let horizon = self.engine.transactions.vacuum_horizon()?;
        let aborted: HashSet<u64> = horizon.aborted.iter().copied().collect();

        let mut purged = 0;
        for table in self.engine.storage.all_tables().await {
            purged += table.write().await.vacuum(&horizon, &aborted);
        }

        let forgotten: Vec<u64> = aborted.into_iter().collect();
        self.engine.transactions.forget_aborted(&forgotten)?;
        Ok(purged)
    }

    async fn run_write(&self, txn_id: TransactionId, statement: &Statement) -> Result<u64> {
        let table = self.engine.storage.get_table(statement.table()).await?;
        let mut table = table.write().await;

        // Snapshots are taken under the table lock so no commit slips in between
        let reader = self.engine.transactions.statement_snapshot(txn_id)?;
        let writer = self.engine.transactions.write_snapshot(txn_id)?;

        match statement {
            Statement::Insert { columns, values, .. } => {
                let row = table.shape_row(columns, values.clone())?;
                table.insert(row, &writer)?;
                Ok(1)
            }
            Statement::Update {
                assignments,
                filter,
                ..
            } => table.update(filter, assignments, &reader, &writer),
            Statement::Delete { filter, .. } => table.delete(filter, &reader, &writer),
            other => Err(DbError::ExecutionError(format!(
                "Statement on '{}' is not a write",
                other.table()
            ))),
        }
    }

    async fn run_select(&self, txn_id: Option<TransactionId>, select: &Select) -> Result<Vec<Row>> {
        let table = self.engine.storage.get_table(&select.table).await?;
        let table = table.read().await;
        let snapshot = match txn_id {
            Some(id) => self.engine.transactions.statement_snapshot(id)?,
            None => self.engine.transactions.read_snapshot()?,
        };

        match &select.projection {
            Projection::All => table.select(
                &select.filter,
                &select.order_by,
                select.offset,
                select.limit,
                &snapshot,
            ),
            Projection::Columns(columns) => {
                let positions = columns
                    .iter()
                    .map(|c| table.schema().require_column(c))
                    .collect::<Result<Vec<_>>>()?;
                let rows = table.select(
                    &select.filter,
                    &select.order_by,
                    select.offset,
                    select.limit,
                    &snapshot,
                )?;
                Ok(rows
                    .into_iter()
                    .map(|row| positions.iter().map(|idx| row[*idx].clone()).collect())
                    .collect())
            }
            Projection::Count => {
                let rows = table.select(&select.filter, &[], None, None, &snapshot)?;
                Ok(vec![vec![Value::Integer(rows.len() as i64)]])
            }
            Projection::Max(column) => {
                let idx = table.schema().require_column(column)?;
                let rows = table.select(&select.filter, &[], None, None, &snapshot)?;
                let max = rows
                    .into_iter()
                    .map(|mut row| row.swap_remove(idx))
                    .filter(|v| !v.is_null())
                    .max()
                    .unwrap_or(Value::Null);
                Ok(vec![vec![max]])
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryDB {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open_connection()))
    }
}

struct ActiveTransaction {
    id: TransactionId,
    _serial: Option<OwnedMutexGuard<()>>,
}

/// Connection to an [`InMemoryDB`].
///
/// Dropping a connection with an open transaction rolls it back.
pub struct MemoryConnection {
    id: u64,
    db: InMemoryDB,
    transaction: Option<ActiveTransaction>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.id)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.transaction.is_some() {
            return Err(DbError::ExecutionError("Transaction already active".into()));
        }

        let serial = match isolation {
            IsolationLevel::Serializable => Some(self.db.engine.serial.clone().lock_owned().await),
            _ => None,
        };
        let id = self.db.engine.transactions.begin(isolation)?;
        self.transaction = Some(ActiveTransaction { id, _serial: serial });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| DbError::ExecutionError("No active transaction".into()))?;
        self.db.engine.transactions.commit(transaction.id)
    }

    async fn rollback(&mut self) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| DbError::ExecutionError("No active transaction".into()))?;
        self.db.engine.transactions.rollback(transaction.id)
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        match statement {
            Statement::CreateTable {
                schema,
                if_not_exists,
            } => {
                let created = self
                    .db
                    .engine
                    .storage
                    .create_table(schema.clone(), *if_not_exists)
                    .await?;
                Ok(created as u64)
            }
            Statement::DropTable { name, if_exists } => {
                let dropped = self.db.engine.storage.drop_table(name, *if_exists).await?;
                Ok(dropped as u64)
            }
            Statement::Select(select) => {
                let txn_id = self.transaction_id();
                Ok(self.db.run_select(txn_id, select).await?.len() as u64)
            }
            _ => match self.transaction_id() {
                Some(txn_id) => self.db.run_write(txn_id, statement).await,
                None => {
                    // Autocommit
                    let txn_id = self
                        .db
                        .engine
                        .transactions
                        .begin(IsolationLevel::ReadCommitted)?;
                    match self.db.run_write(txn_id, statement).await {
                        Ok(affected) => {
                            self.db.engine.transactions.commit(txn_id)?;
                            Ok(affected)
                        }
                        Err(err) => {
                            self.db.engine.transactions.rollback(txn_id)?;
                            Err(err)
                        }
                    }
                }
            },
        }
    }

    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        match statement {
            Statement::Select(select) => self.db.run_select(self.transaction_id(), select).await,
            other => Err(DbError::ExecutionError(format!(
                "Statement on '{}' does not return rows",
                other.table()
            ))),
        }
    }

    fn supports_batching(&self) -> bool {
        true
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            let _ = self.db.engine.transactions.rollback(transaction.id);
        }
    }
}
