// ============================================================================
// Index definitions
// ============================================================================
//
// Applications describe indexes with the typed builders `MapIndex` and
// `ReduceIndex`. Registration erases them into `IndexDefinition`, whose
// functions work on serde trees so the engine can run them against stored
// content without knowing the entity type.
//
// ============================================================================

use crate::core::{Column, DbError, Result, Row, Value};
use crate::dialect::validate_identifier;
use crate::document::Entity;
use crate::index::layout::RESERVED_COLUMNS;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

type JsonValue = serde_json::Value;

/// A row of an index table.
///
/// `columns()` lists the persisted columns in order; each names a field of the
/// serialized record.
pub trait IndexRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn columns() -> Vec<Column>;
}

pub(crate) type MapFn = Arc<dyn Fn(&JsonValue) -> Result<Vec<JsonValue>> + Send + Sync>;
pub(crate) type GroupFn = Arc<dyn Fn(&JsonValue) -> Result<Value> + Send + Sync>;
pub(crate) type ReduceFn = Arc<dyn Fn(Option<&JsonValue>, &[JsonValue]) -> Result<JsonValue> + Send + Sync>;
pub(crate) type DeleteFn =
    Arc<dyn Fn(&JsonValue, &[JsonValue]) -> Result<Option<JsonValue>> + Send + Sync>;

#[derive(Clone)]
pub struct MapDefinition {
    pub name: String,
    pub document_type: String,
    pub columns: Vec<Column>,
    pub(crate) map: MapFn,
}

#[derive(Clone)]
pub struct ReduceDefinition {
    pub name: String,
    pub document_type: String,
    pub columns: Vec<Column>,
    pub(crate) map: MapFn,
    pub(crate) group: GroupFn,
    pub(crate) reduce: ReduceFn,
    pub(crate) delete: Option<DeleteFn>,
}

#[derive(Clone)]
pub enum IndexDefinition {
    Map(MapDefinition),
    Reduce(ReduceDefinition),
}

impl IndexDefinition {
    pub fn name(&self) -> &str {
        match self {
            IndexDefinition::Map(def) => &def.name,
            IndexDefinition::Reduce(def) => &def.name,
        }
    }

    pub fn document_type(&self) -> &str {
        match self {
            IndexDefinition::Map(def) => &def.document_type,
            IndexDefinition::Reduce(def) => &def.document_type,
        }
    }

    pub fn columns(&self) -> &[Column] {
        match self {
            IndexDefinition::Map(def) => &def.columns,
            IndexDefinition::Reduce(def) => &def.columns,
        }
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, IndexDefinition::Reduce(_))
    }

    /// Run the map function over stored content
    pub(crate) fn map(&self, content: &JsonValue) -> Result<Vec<JsonValue>> {
        match self {
            IndexDefinition::Map(def) => (def.map)(content),
            IndexDefinition::Reduce(def) => (def.map)(content),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(self.name())?;
        let columns = self.columns();
        if columns.is_empty() {
            return Err(DbError::InvalidDefinition(format!(
                "Index '{}' declares no columns",
                self.name()
            )));
        }
        for (idx, column) in columns.iter().enumerate() {
            validate_identifier(&column.name)?;
            if RESERVED_COLUMNS.contains(&column.name.as_str()) {
                return Err(DbError::InvalidDefinition(format!(
                    "Column '{}' of index '{}' uses a reserved name",
                    column.name,
                    self.name()
                )));
            }
            if column.primary_key || column.unique {
                return Err(DbError::InvalidDefinition(format!(
                    "Column '{}' of index '{}' cannot carry key constraints",
                    column.name,
                    self.name()
                )));
            }
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(DbError::InvalidDefinition(format!(
                    "Column '{}' appears twice in index '{}'",
                    column.name,
                    self.name()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_reduce() { "Reduce" } else { "Map" };
        f.debug_struct(kind)
            .field("name", &self.name())
            .field("document_type", &self.document_type())
            .field("columns", &self.columns())
            .finish()
    }
}

/// Conversion of builders into a registrable definition
pub trait IntoIndexDefinition {
    fn into_definition(self) -> Result<IndexDefinition>;
}

impl IntoIndexDefinition for IndexDefinition {
    fn into_definition(self) -> Result<IndexDefinition> {
        Ok(self)
    }
}

/// Convert a serialized record to column values, in column order
pub(crate) fn entry_to_row(columns: &[Column], entry: &JsonValue) -> Result<Row> {
    let JsonValue::Object(fields) = entry else {
        return Err(DbError::Serialization(format!(
            "Index entries must serialize to an object, got {}",
            entry
        )));
    };
    columns
        .iter()
        .map(|column| {
            let value = fields
                .get(&column.name)
                .map(Value::from_json)
                .transpose()?
                .unwrap_or(Value::Null);
            column.validate(&value)?;
            Ok(value)
        })
        .collect()
}

/// Rebuild a serialized record from column values
pub(crate) fn row_to_entry(columns: &[Column], values: &[Value]) -> JsonValue {
    let fields = columns
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), value.to_json()))
        .collect();
    JsonValue::Object(fields)
}

fn decode<T: DeserializeOwned>(value: &JsonValue) -> Result<T> {
    Ok(serde_json::from_value(value.clone())?)
}

fn decode_all<T: DeserializeOwned>(values: &[JsonValue]) -> Result<Vec<T>> {
    values.iter().map(decode).collect()
}

fn encode<T: Serialize>(value: &T) -> Result<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

fn erase_map<T: Entity, E: IndexRecord>(map: Arc<dyn Fn(&T) -> Vec<E> + Send + Sync>) -> MapFn {
    Arc::new(move |content: &JsonValue| {
        let document: T = decode(content)?;
        map(&document).iter().map(encode).collect()
    })
}

fn missing(index: &str, function: &str) -> DbError {
    DbError::InvalidDefinition(format!("Index '{}' has no {} function", index, function))
}

/// Builder for a map index: every document of `T` contributes its own rows `E`.
pub struct MapIndex<T, E> {
    name: String,
    map: Option<Arc<dyn Fn(&T) -> Vec<E> + Send + Sync>>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T: Entity, E: IndexRecord> MapIndex<T, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: None,
            _marker: PhantomData,
        }
    }

    pub fn map<F>(mut self, map: F) -> Self
    where
        F: Fn(&T) -> Vec<E> + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(map));
        self
    }
}

impl<T: Entity, E: IndexRecord> IntoIndexDefinition for MapIndex<T, E> {
    fn into_definition(self) -> Result<IndexDefinition> {
        let map = self.map.ok_or_else(|| missing(&self.name, "map"))?;
        let definition = IndexDefinition::Map(MapDefinition {
            name: self.name,
            document_type: T::type_name().to_string(),
            columns: E::columns(),
            map: erase_map(map),
        });
        definition.validate()?;
        Ok(definition)
    }
}

/// Builder for a reduce index: entries sharing a group key fold into one aggregate row.
///
/// Without a `delete` function, removed contributions are handled by recomputing the
/// aggregate from the documents that still contribute.
pub struct ReduceIndex<T, E> {
    name: String,
    map: Option<Arc<dyn Fn(&T) -> Vec<E> + Send + Sync>>,
    group: Option<Arc<dyn Fn(&E) -> Value + Send + Sync>>,
    reduce: Option<Arc<dyn Fn(Option<&E>, &[E]) -> E + Send + Sync>>,
    delete: Option<Arc<dyn Fn(&E, &[E]) -> Option<E> + Send + Sync>>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T: Entity, E: IndexRecord> ReduceIndex<T, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: None,
            group: None,
            reduce: None,
            delete: None,
            _marker: PhantomData,
        }
    }

    pub fn map<F>(mut self, map: F) -> Self
    where
        F: Fn(&T) -> Vec<E> + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(map));
        self
    }

    pub fn group<K, F>(mut self, group: F) -> Self
    where
        K: Into<Value>,
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        self.group = Some(Arc::new(move |entry: &E| group(entry).into()));
        self
    }

    /// `reduce(existing, entries)` folds entries into the aggregate, building it from
    /// scratch when `existing` is `None`.
    pub fn reduce<F>(mut self, reduce: F) -> Self
    where
        F: Fn(Option<&E>, &[E]) -> E + Send + Sync + 'static,
    {
        self.reduce = Some(Arc::new(reduce));
        self
    }

    /// `delete(existing, removed)` takes contributions out; `None` removes the row.
    pub fn delete<F>(mut self, delete: F) -> Self
    where
        F: Fn(&E, &[E]) -> Option<E> + Send + Sync + 'static,
    {
        self.delete = Some(Arc::new(delete));
        self
    }
}

impl<T: Entity, E: IndexRecord> IntoIndexDefinition for ReduceIndex<T, E> {
    fn into_definition(self) -> Result<IndexDefinition> {
        let map = self.map.ok_or_else(|| missing(&self.name, "map"))?;
        let group = self.group.ok_or_else(|| missing(&self.name, "group"))?;
        let reduce = self.reduce.ok_or_else(|| missing(&self.name, "reduce"))?;

        let group: GroupFn = Arc::new(move |entry: &JsonValue| {
            let key = group(&decode::<E>(entry)?);
            if key.is_null() {
                return Err(DbError::DefinitionViolation(
                    "Group key must not be NULL".to_string(),
                ));
            }
            Ok(key)
        });
        let reduce: ReduceFn = Arc::new(move |existing: Option<&JsonValue>, entries: &[JsonValue]| {
            let existing = existing.map(decode::<E>).transpose()?;
            let entries = decode_all::<E>(entries)?;
            encode(&reduce(existing.as_ref(), &entries))
        });
        let delete = self.delete.map(|delete| -> DeleteFn {
            Arc::new(move |existing: &JsonValue, removed: &[JsonValue]| {
                let existing = decode::<E>(existing)?;
                let removed = decode_all::<E>(removed)?;
                delete(&existing, &removed).as_ref().map(encode).transpose()
            })
        });

        let definition = IndexDefinition::Reduce(ReduceDefinition {
            name: self.name,
            document_type: T::type_name().to_string(),
            columns: E::columns(),
            map: erase_map(map),
            group,
            reduce,
            delete,
        });
        definition.validate()?;
        Ok(definition)
    }
}
