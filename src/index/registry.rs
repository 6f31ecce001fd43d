use super::IndexDefinition;
use crate::core::{DbError, Result};
use std::collections::HashMap;

/// Index definitions of a store, frozen once the store is built.
#[derive(Debug, Default, Clone)]
pub struct IndexRegistry {
    definitions: Vec<IndexDefinition>,
    by_name: HashMap<String, usize>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: IndexDefinition) -> Result<()> {
        definition.validate()?;
        if self.by_name.contains_key(definition.name()) {
            return Err(DbError::DuplicateIndex(definition.name().to_string()));
        }

        let position = self.definitions.len();
        self.by_name.insert(definition.name().to_string(), position);
        self.definitions.push(definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&IndexDefinition> {
        self.by_name
            .get(name)
            .map(|idx| &self.definitions[*idx])
            .ok_or_else(|| DbError::UnknownIndex(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
