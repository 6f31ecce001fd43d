//! Persisted schema layout: table names and schemas for documents and indexes.

use super::{IndexDefinition, IndexRegistry};
use crate::core::{Column, DataType, DbError, Result, TableSchema};
use std::collections::HashMap;
use crate::dialect::validate_identifier;

pub const ID: &str = "Id";
pub const TYPE: &str = "Type";
pub const CONTENT: &str = "Content";
pub const VERSION: &str = "Version";
pub const DOCUMENT_ID: &str = "DocumentId";
pub const GROUP_KEY: &str = "GroupKey";
pub const INDEX_ID: &str = "IndexId";

/// Column names the layout adds itself; index records may not reuse them
pub const RESERVED_COLUMNS: &[&str] = &[ID, TYPE, CONTENT, VERSION, DOCUMENT_ID, GROUP_KEY, INDEX_ID];

/// Number of layout columns in front of the entry columns of an index table
pub fn prefix_width(definition: &IndexDefinition) -> usize {
    match definition {
        IndexDefinition::Map(_) => 2,
        IndexDefinition::Reduce(_) => 3,
    }
}

#[derive(Debug, Clone)]
pub struct StoreLayout {
    prefix: String,
    document_table: String,
}

impl StoreLayout {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let document_table = format!("{}Document", prefix);
        validate_identifier(&document_table)?;
        Ok(Self {
            prefix,
            document_table,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn document_table(&self) -> &str {
        &self.document_table
    }

    pub fn index_table(&self, definition: &IndexDefinition) -> String {
        format!("{}{}", self.prefix, definition.name())
    }

    pub fn bridge_table(&self, definition: &IndexDefinition) -> String {
        format!("{}{}_Document", self.prefix, definition.name())
    }

    pub fn document_schema(&self) -> TableSchema {
        TableSchema::new(
            self.document_table.clone(),
            vec![
                Column::new(ID, DataType::Integer).primary_key(),
                Column::new(TYPE, DataType::Text).not_null(),
                Column::new(CONTENT, DataType::Text).not_null(),
                Column::new(VERSION, DataType::Integer).not_null(),
            ],
        )
        .with_index(TYPE)
    }

    pub fn index_schema(&self, definition: &IndexDefinition) -> TableSchema {
        let mut columns = match definition {
            IndexDefinition::Map(_) => vec![
                Column::new(ID, DataType::Integer).primary_key(),
                Column::new(DOCUMENT_ID, DataType::Integer).not_null(),
            ],
            IndexDefinition::Reduce(_) => vec![
                Column::new(ID, DataType::Integer).primary_key(),
                Column::new(GROUP_KEY, DataType::Text).not_null().unique(),
                Column::new(VERSION, DataType::Integer).not_null(),
            ],
        };
        columns.extend(definition.columns().iter().cloned());

        let schema = TableSchema::new(self.index_table(definition), columns);
        match definition {
            IndexDefinition::Map(_) => schema.with_index(DOCUMENT_ID),
            IndexDefinition::Reduce(_) => schema,
        }
    }

    pub fn index_columns(&self, definition: &IndexDefinition) -> Vec<String> {
        self.index_schema(definition).column_names()
    }

    pub fn bridge_schema(&self, definition: &IndexDefinition) -> Option<TableSchema> {
        definition.is_reduce().then(|| {
            TableSchema::new(
                self.bridge_table(definition),
                vec![
                    Column::new(DOCUMENT_ID, DataType::Integer).not_null(),
                    Column::new(INDEX_ID, DataType::Integer).not_null(),
                ],
            )
            .with_index(DOCUMENT_ID)
            .with_index(INDEX_ID)
        })
    }

    /// Every table the store needs, documents first.
    ///
    /// Table names must be distinct ignoring ASCII case, so an index cannot be named
    /// after the document table or another index's bridge table.
    pub fn schemas(&self, registry: &IndexRegistry) -> Result<Vec<TableSchema>> {
        let mut schemas = vec![self.document_schema()];
        for definition in registry.iter() {
            validate_identifier(&self.bridge_table(definition))?;
            schemas.push(self.index_schema(definition));
            schemas.extend(self.bridge_schema(definition));
        }

        let mut owners: HashMap<String, String> = HashMap::new();
        for schema in &schemas {
            let key = schema.name().to_ascii_lowercase();
            if let Some(previous) = owners.insert(key, schema.name().to_string()) {
                return Err(DbError::InvalidDefinition(format!(
                    "Table name '{}' is used twice (clashes with '{}')",
                    schema.name(),
                    previous
                )));
            }
        }
        Ok(schemas)
    }

    /// Tables whose `Id` the store assigns
    pub fn identity_tables(&self, registry: &IndexRegistry) -> Vec<String> {
        std::iter::once(self.document_table.clone())
            .chain(registry.iter().map(|d| self.index_table(d)))
            .collect()
    }
}
