use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out `Id` values for the store's tables.
///
/// Sequences start past `MAX(Id)` when the store is built and are moved forward
/// again whenever a flush collides with ids taken by another store on the same
/// backend. A sequence never moves backwards.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counters: HashMap<String, AtomicI64>,
}

impl IdGenerator {
    /// One sequence per table, each starting at 1
    pub fn new(tables: impl IntoIterator<Item = String>) -> Self {
        Self {
            counters: tables
                .into_iter()
                .map(|table| (table, AtomicI64::new(1)))
                .collect(),
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.counters.keys().map(String::as_str)
    }

    /// Make the next id of `table` greater than `max_id`
    pub fn advance(&self, table: &str, max_id: i64) -> Result<()> {
        self.counter(table)?.fetch_max(max_id + 1, Ordering::SeqCst);
        Ok(())
    }

    pub fn next(&self, table: &str) -> Result<i64> {
        Ok(self.counter(table)?.fetch_add(1, Ordering::SeqCst))
    }

    fn counter(&self, table: &str) -> Result<&AtomicI64> {
        self.counters
            .get(table)
            .ok_or_else(|| DbError::InvalidState(format!("No id sequence for table '{}'", table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> IdGenerator {
        IdGenerator::new(["Document".to_string(), "PostsByDay".to_string()])
    }

    #[test]
    fn test_sequences_are_per_table() {
        let ids = generator();
        ids.advance("PostsByDay", 41).unwrap();

        assert_eq!(ids.next("Document").unwrap(), 1);
        assert_eq!(ids.next("Document").unwrap(), 2);
        assert_eq!(ids.next("PostsByDay").unwrap(), 42);
        assert!(matches!(ids.next("Missing"), Err(DbError::InvalidState(_))));
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let ids = generator();
        ids.advance("Document", 10).unwrap();
        ids.advance("Document", 3).unwrap();
        assert_eq!(ids.next("Document").unwrap(), 11);

        // Ids already handed out count as taken
        ids.advance("Document", 11).unwrap();
        assert_eq!(ids.next("Document").unwrap(), 12);
    }
}
