use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    // ========================================
    // Flush outcomes
    // ========================================
    #[error("Concurrency conflict on '{table}' row {id}")]
    ConcurrencyConflict { table: String, id: i64 },

    #[error("Command '{command}' failed: {source}")]
    CommandFailed {
        command: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Index definition contract violated: {0}")]
    DefinitionViolation(String),

    #[error("Invalid index definition: {0}")]
    InvalidDefinition(String),

    // ========================================
    // Usage errors
    // ========================================
    #[error("Entity {0} is not tracked by this session")]
    UntrackedEntity(i64),

    #[error("Index '{0}' is already registered")]
    DuplicateIndex(String),

    #[error("Index '{0}' is not registered")]
    UnknownIndex(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ========================================
    // Backend errors
    // ========================================
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Write-write conflict on table '{0}'")]
    WriteConflict(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// True when retrying the whole operation in a fresh session may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// True for failures that a retry will not fix.
    pub fn is_fatal(&self) -> bool {
        !self.is_conflict()
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let conflict = DbError::ConcurrencyConflict {
            table: "Document".into(),
            id: 7,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_fatal());

        let failed = DbError::CommandFailed {
            command: "CreateDocument".into(),
            source: Box::new(DbError::ConstraintViolation("duplicate".into())),
        };
        assert!(failed.is_fatal());
        assert!(failed.to_string().contains("duplicate"));
    }
}
