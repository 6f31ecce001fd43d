pub mod memory;
pub mod statement;

use crate::core::{DbError, Result, Row};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

pub use memory::{InMemoryDB, MemoryConnection};
pub use statement::{CompareOp, Filter, OrderBy, Predicate, Projection, Select, Statement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" | "snapshot" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(DbError::ParseError(format!("Unknown isolation level '{}'", other))),
        }
    }
}

/// A physical connection to a relational backend.
///
/// Statements issued between `begin` and `commit`/`rollback` belong to one transaction;
/// outside a transaction every statement commits on its own.
#[async_trait]
pub trait Connection: Send {
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    /// Execute a write or DDL statement, returning the number of affected rows
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Whether several statements can share one round trip
    fn supports_batching(&self) -> bool {
        false
    }

    /// Execute statements in order, stopping after the first failure.
    ///
    /// The result holds one entry per attempted statement; only the last one may be an error.
    async fn execute_batch(&mut self, statements: &[Statement]) -> Vec<Result<u64>> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let result = self.execute(statement).await;
            let failed = result.is_err();
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }
}

/// Opens connections for sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert_eq!(
            "Read Committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable-read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!("chaos".parse::<IsolationLevel>().is_err());
    }
}
