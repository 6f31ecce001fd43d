// ============================================================================
// Commands
// ============================================================================
//
// One unit of persistence work produced by a flush. Each command carries the
// statement to run, the rank that sequences it and what it expects back.
//
// ============================================================================

pub mod pipeline;

use crate::connection::Statement;
use crate::core::Row;
use crate::document::DocumentId;
use std::fmt;

pub use pipeline::{CommandPipeline, PipelineStats};

/// Execution rank. Lower ranks run first; ties keep production order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionOrder {
    DeleteIndex = 1,
    DeleteDocument = 2,
    CreateDocument = 3,
    UpdateDocument = 4,
    CreateIndex = 5,
    UpdateIndex = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    InsertDocument,
    UpdateDocument,
    DeleteDocument,
    InsertMapRow,
    DeleteMapRows,
    InsertReduceRow,
    UpdateReduceRow,
    DeleteReduceRow,
    InsertBridge,
    DeleteBridges,
}

impl CommandKind {
    pub fn order(&self) -> ExecutionOrder {
        match self {
            CommandKind::DeleteMapRows | CommandKind::DeleteReduceRow | CommandKind::DeleteBridges => {
                ExecutionOrder::DeleteIndex
            }
            CommandKind::DeleteDocument => ExecutionOrder::DeleteDocument,
            CommandKind::InsertDocument => ExecutionOrder::CreateDocument,
            CommandKind::UpdateDocument => ExecutionOrder::UpdateDocument,
            CommandKind::InsertMapRow | CommandKind::InsertReduceRow | CommandKind::InsertBridge => {
                ExecutionOrder::CreateIndex
            }
            CommandKind::UpdateReduceRow => ExecutionOrder::UpdateIndex,
        }
    }

    /// Inserts whose `Id` comes from the store's id sequences
    pub fn assigns_id(&self) -> bool {
        matches!(
            self,
            CommandKind::InsertDocument | CommandKind::InsertMapRow | CommandKind::InsertReduceRow
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a command must report as affected rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Exactly one row; zero means a concurrent writer got there first
    One,
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub statement: Statement,
    pub expectation: Expectation,
    /// Row the command targets, reported on conflict
    pub target: DocumentId,
}

impl Command {
    pub fn new(kind: CommandKind, statement: Statement, expectation: Expectation, target: i64) -> Self {
        Self {
            kind,
            statement,
            expectation,
            target,
        }
    }

    pub fn insert(kind: CommandKind, table: &str, columns: Vec<String>, values: Row, target: i64) -> Self {
        Self::new(
            kind,
            Statement::insert(table, columns, values),
            Expectation::One,
            target,
        )
    }

    pub fn order(&self) -> ExecutionOrder {
        self.kind.order()
    }

    pub fn table(&self) -> &str {
        self.statement.table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranks_follow_dependency_order() {
        let mut kinds = vec![
            CommandKind::UpdateReduceRow,
            CommandKind::InsertBridge,
            CommandKind::UpdateDocument,
            CommandKind::InsertDocument,
            CommandKind::DeleteDocument,
            CommandKind::DeleteBridges,
        ];
        kinds.sort_by_key(|k| k.order());
        assert_eq!(
            kinds,
            vec![
                CommandKind::DeleteBridges,
                CommandKind::DeleteDocument,
                CommandKind::InsertDocument,
                CommandKind::UpdateDocument,
                CommandKind::InsertBridge,
                CommandKind::UpdateReduceRow,
            ]
        );
    }
}
