use super::{Command, Expectation};
use crate::connection::{Connection, Statement};
use crate::core::{DbError, Result};
use crate::dialect::Dialect;
use tracing::{Level, event};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub commands: usize,
    pub round_trips: usize,
    pub rows_affected: u64,
}

/// Orders the commands of one flush and runs them on the flush's connection.
///
/// The caller owns the transaction: any error returned here must be followed by a
/// rollback.
pub struct CommandPipeline<'a> {
    dialect: &'a dyn Dialect,
    batch_size: usize,
}

impl<'a> CommandPipeline<'a> {
    pub fn new(dialect: &'a dyn Dialect, batch_size: usize) -> Self {
        Self {
            dialect,
            batch_size,
        }
    }

    /// Stable sort by execution rank
    pub fn sort(commands: &mut [Command]) {
        commands.sort_by_key(Command::order);
    }

    pub async fn execute(
        &self,
        connection: &mut dyn Connection,
        mut commands: Vec<Command>,
    ) -> Result<PipelineStats> {
        Self::sort(&mut commands);
        let mut stats = PipelineStats::default();

        if self.batch_size > 1 && connection.supports_batching() {
            for chunk in commands.chunks(self.batch_size) {
                let statements: Vec<Statement> = chunk
                    .iter()
                    .map(|command| {
                        self.trace(command);
                        command.statement.clone()
                    })
                    .collect();
                let results = connection.execute_batch(&statements).await;
                stats.round_trips += 1;

                let attempted = results.len();
                for (command, result) in chunk.iter().zip(results) {
                    stats.rows_affected += self.check(command, result)?;
                    stats.commands += 1;
                }
                if attempted < chunk.len() {
                    let source = DbError::ExecutionError("Batch ended before this command".into());
                    return Err(self.failed(&chunk[attempted], source));
                }
            }
        } else {
            for command in &commands {
                self.trace(command);
                let result = connection.execute(&command.statement).await;
                stats.round_trips += 1;
                stats.rows_affected += self.check(command, result)?;
                stats.commands += 1;
            }
        }

        Ok(stats)
    }

    fn trace(&self, command: &Command) {
        event!(
            Level::TRACE,
            kind = %command.kind,
            sql = %self.dialect.render(&command.statement),
            "execute command"
        );
    }

    fn check(&self, command: &Command, result: Result<u64>) -> Result<u64> {
        match result {
            Ok(0) if command.expectation == Expectation::One => Err(self.conflict(command)),
            Ok(affected) => Ok(affected),
            Err(DbError::WriteConflict(_)) => Err(self.conflict(command)),
            // Another session created the same group key, or another store handed out the same id
            Err(DbError::ConstraintViolation(_)) if command.kind.assigns_id() => {
                Err(self.conflict(command))
            }
            Err(source) => Err(self.failed(command, source)),
        }
    }

    fn conflict(&self, command: &Command) -> DbError {
        event!(
            Level::WARN,
            kind = %command.kind,
            table = command.table(),
            id = command.target,
            "concurrency conflict"
        );
        DbError::ConcurrencyConflict {
            table: command.table().to_string(),
            id: command.target,
        }
    }

    fn failed(&self, command: &Command, source: DbError) -> DbError {
        event!(Level::ERROR, kind = %command.kind, error = %source, "command failed");
        DbError::CommandFailed {
            command: format!("{}: {}", command.kind, self.dialect.render(&command.statement).sql),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::connection::{Filter, IsolationLevel};
    use crate::core::{Row, Value};
    use crate::dialect::SqliteDialect;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Records statements and replays scripted outcomes
    struct Scripted {
        batching: bool,
        outcomes: VecDeque<Result<u64>>,
        executed: Vec<String>,
    }

    impl Scripted {
        fn new(batching: bool, outcomes: Vec<Result<u64>>) -> Self {
            Self {
                batching,
                outcomes: outcomes.into(),
                executed: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Connection for Scripted {
        async fn begin(&mut self, _isolation: IsolationLevel) -> Result<()> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            true
        }

        async fn execute(&mut self, statement: &Statement) -> Result<u64> {
            self.executed.push(statement.table().to_string());
            self.outcomes.pop_front().unwrap_or(Ok(1))
        }

        async fn query(&mut self, _statement: &Statement) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn supports_batching(&self) -> bool {
            self.batching
        }
    }

    fn command(kind: CommandKind, table: &str) -> Command {
        Command::new(
            kind,
            Statement::delete(table, Filter::new().eq("Id", 1)),
            Expectation::One,
            1,
        )
    }

    #[tokio::test]
    async fn test_executes_in_rank_order_keeping_production_order() {
        let commands = vec![
            command(CommandKind::UpdateReduceRow, "reduce"),
            command(CommandKind::InsertDocument, "doc_a"),
            command(CommandKind::DeleteBridges, "bridge"),
            command(CommandKind::InsertDocument, "doc_b"),
            command(CommandKind::InsertMapRow, "map"),
        ];
        let mut connection = Scripted::new(false, Vec::new());
        let stats = CommandPipeline::new(&SqliteDialect, 0)
            .execute(&mut connection, commands)
            .await
            .unwrap();

        assert_eq!(connection.executed, vec!["bridge", "doc_a", "doc_b", "map", "reduce"]);
        assert_eq!(stats.commands, 5);
        assert_eq!(stats.round_trips, 5);
    }

    #[tokio::test]
    async fn test_zero_rows_is_a_conflict_and_stops() {
        let commands = vec![
            command(CommandKind::UpdateDocument, "Document"),
            command(CommandKind::InsertMapRow, "map"),
        ];
        let mut connection = Scripted::new(false, vec![Ok(0)]);
        let err = CommandPipeline::new(&SqliteDialect, 0)
            .execute(&mut connection, commands)
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::ConcurrencyConflict { ref table, id: 1 } if table == "Document"));
        assert_eq!(connection.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let mut connection = Scripted::new(
            false,
            vec![Err(DbError::ConstraintViolation("GroupKey".into()))],
        );
        let err = CommandPipeline::new(&SqliteDialect, 0)
            .execute(&mut connection, vec![command(CommandKind::InsertReduceRow, "reduce")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // A taken id is retryable, a constraint hit elsewhere is not
        let mut connection = Scripted::new(false, vec![Err(DbError::ConstraintViolation("Id".into()))]);
        let err = CommandPipeline::new(&SqliteDialect, 0)
            .execute(&mut connection, vec![command(CommandKind::InsertDocument, "Document")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let mut connection = Scripted::new(false, vec![Err(DbError::ConstraintViolation("Id".into()))]);
        let err = CommandPipeline::new(&SqliteDialect, 0)
            .execute(&mut connection, vec![command(CommandKind::InsertBridge, "bridge")])
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let mut connection = Scripted::new(false, vec![Err(DbError::TableNotFound("map".into()))]);
        let err = CommandPipeline::new(&SqliteDialect, 0)
            .execute(&mut connection, vec![command(CommandKind::InsertMapRow, "map")])
            .await
            .unwrap_err();
        match err {
            DbError::CommandFailed { command, source } => {
                assert!(command.starts_with("InsertMapRow: DELETE FROM \"map\""));
                assert!(matches!(*source, DbError::TableNotFound(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batches_share_round_trips() {
        let commands = (0..5)
            .map(|i| {
                Command::new(
                    CommandKind::InsertMapRow,
                    Statement::insert("map", vec!["Id".into()], vec![Value::Integer(i)]),
                    Expectation::One,
                    i,
                )
            })
            .collect();
        let mut connection = Scripted::new(true, Vec::new());
        let stats = CommandPipeline::new(&SqliteDialect, 2)
            .execute(&mut connection, commands)
            .await
            .unwrap();

        assert_eq!(stats.commands, 5);
        assert_eq!(stats.round_trips, 3);
    }

    #[tokio::test]
    async fn test_batch_failure_aborts() {
        let commands = vec![
            command(CommandKind::DeleteBridges, "bridge"),
            command(CommandKind::DeleteDocument, "Document"),
            command(CommandKind::InsertDocument, "Document"),
        ];
        let mut connection = Scripted::new(true, vec![Ok(1), Err(DbError::WriteConflict("Document".into()))]);
        let err = CommandPipeline::new(&SqliteDialect, 8)
            .execute(&mut connection, commands)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(connection.executed.len(), 2);
    }
}
