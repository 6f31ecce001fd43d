use super::Table;
use crate::core::{DbError, Result, TableSchema};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Table registry of the in-memory engine.
pub struct InMemoryStorage {
    /// Tables with individual locks; the map lock only guards creation and removal
    tables: RwLock<HashMap<String, Arc<RwLock<Table>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Create a table. Returns `false` when it already existed and `if_not_exists` was set.
    pub async fn create_table(&self, schema: TableSchema, if_not_exists: bool) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let name = schema.name().to_string();

        if tables.contains_key(&name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(DbError::TableExists(name));
        }

        tables.insert(name, Arc::new(RwLock::new(Table::new(schema))));
        Ok(true)
    }

    pub async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.remove(table_name).is_none() {
            if if_exists {
                return Ok(false);
            }
            return Err(DbError::TableNotFound(table_name.to_string()));
        }
        Ok(true)
    }

    /// Handle to a table for concurrent access
    pub async fn get_table(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        self.tables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub async fn table_exists(&self, name: &str) -> bool {
        self.tables.read().await.contains_key(name)
    }

    pub async fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn all_tables(&self) -> Vec<Arc<RwLock<Table>>> {
        self.tables.read().await.values().cloned().collect()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}
